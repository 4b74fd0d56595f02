use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{Result, SpecErr};

/// A single named filter of a filter cell along with its opaque parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub name: String,
    pub params: Value,
}

/// The filters of a filter cell, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet(Vec<Filter>);

impl FilterSet {
    /// Creates a new `FilterSet` from `(name, params)` pairs.
    pub fn new<I, S>(filters: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Self(
            filters
                .into_iter()
                .map(|(name, params)| Filter {
                    name: name.into(),
                    params,
                })
                .collect(),
        )
    }

    /// Creates a `FilterSet` with the given filter names and no parameters.
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(|n| (n, Value::Object(Map::new()))))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Filter> {
        self.0.iter()
    }
}

/// Which earlier stages feed a filter cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InputSelection {
    /// Only the immediately preceding stage.
    #[default]
    Previous,
    /// Every stage produced so far.
    All,
    /// Exactly the listed stages, in the listed order.
    Stages(Vec<usize>),
}

/// One entry of an architecture, the closed set of cells the assembler knows how to build.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawCellDescriptor")]
pub enum CellDescriptor {
    /// An envelope of filters, optionally fed by skip connections.
    Filter {
        filters: FilterSet,
        outputs: usize,
        inputs: InputSelection,
    },
    /// Halves the spatial extent and doubles the channel width through a pooling and a
    /// convolution branch.
    Widener,
    /// Concatenates the given stages and halves the spatial extent with a single pooling.
    Widener2 { inputs: Vec<usize> },
    /// Terminal marker, the stage output is the current tensor.
    Output,
}

impl CellDescriptor {
    /// Returns the stages this descriptor reads explicitly, if any.
    pub fn references(&self) -> &[usize] {
        match self {
            CellDescriptor::Filter {
                inputs: InputSelection::Stages(stages),
                ..
            } => stages,
            CellDescriptor::Widener2 { inputs } => inputs,
            _ => &[],
        }
    }

    /// Returns true for the cells that double the channel width.
    pub fn is_widener(&self) -> bool {
        matches!(self, CellDescriptor::Widener | CellDescriptor::Widener2 { .. })
    }

    /// A short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CellDescriptor::Filter { .. } => "filter",
            CellDescriptor::Widener => "widener",
            CellDescriptor::Widener2 { .. } => "widener2",
            CellDescriptor::Output => "output",
        }
    }
}

/// The mapping shape descriptors take in the task configuration.
#[derive(Deserialize)]
struct RawCellDescriptor {
    filters: Option<Map<String, Value>>,
    outputs: Option<usize>,
    inputs: Option<Value>,
    widener: Option<Value>,
    widener2: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl RawCellDescriptor {
    fn keys(&self) -> Vec<String> {
        let known = [
            ("filters", self.filters.is_some()),
            ("outputs", self.outputs.is_some()),
            ("inputs", self.inputs.is_some()),
            ("widener", self.widener.is_some()),
            ("widener2", self.widener2.is_some()),
        ];

        known
            .into_iter()
            .filter(|(_, present)| *present)
            .map(|(key, _)| key.to_string())
            .chain(self.rest.keys().cloned())
            .collect()
    }
}

fn parse_stage_list(value: &Value) -> Result<Vec<usize>> {
    let invalid = || SpecErr::InvalidInputSelector(value.to_string());

    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|v| v.as_u64().map(|i| i as usize).ok_or_else(invalid))
        .collect()
}

fn parse_selection(value: Option<&Value>) -> Result<InputSelection> {
    match value {
        None => Ok(InputSelection::Previous),
        Some(Value::String(s)) if s == "all" => Ok(InputSelection::All),
        Some(v) => parse_stage_list(v).map(InputSelection::Stages),
    }
}

impl TryFrom<RawCellDescriptor> for CellDescriptor {
    type Error = SpecErr;

    fn try_from(raw: RawCellDescriptor) -> Result<Self> {
        if let Some(filters) = &raw.filters {
            let outputs = raw
                .outputs
                .ok_or_else(|| SpecErr::UnrecognizedCell { keys: raw.keys() })?;

            return Ok(CellDescriptor::Filter {
                filters: FilterSet::new(filters.clone()),
                outputs,
                inputs: parse_selection(raw.inputs.as_ref())?,
            });
        }

        if raw.widener.is_some() {
            return Ok(CellDescriptor::Widener);
        }

        if raw.widener2.is_some() {
            let inputs = match &raw.inputs {
                Some(v) => parse_stage_list(v)?,
                None => Vec::new(),
            };
            return Ok(CellDescriptor::Widener2 { inputs });
        }

        if raw.outputs.is_some() {
            return Ok(CellDescriptor::Output);
        }

        Err(SpecErr::UnrecognizedCell { keys: raw.keys() })
    }
}

/// A validated, ordered sequence of cell descriptors.
///
/// Stage `0` is the output of the init cell, descriptor `i` produces stage `i + 1`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<CellDescriptor>")]
pub struct ArchSpec {
    cells: Vec<CellDescriptor>,
}

impl ArchSpec {
    /// Creates a new `ArchSpec`.
    ///
    /// # Arguments
    /// * `cells` - The descriptors in processing order.
    ///
    /// # Returns
    /// A new `ArchSpec` or an error if any descriptor references a stage that isn't strictly
    /// earlier than its own, or is otherwise malformed.
    pub fn new<I>(cells: I) -> Result<Self>
    where
        I: IntoIterator<Item = CellDescriptor>,
    {
        let cells: Vec<_> = cells.into_iter().collect();

        for (i, cell) in cells.iter().enumerate() {
            let stage = i + 1;

            if let Some(&reference) = cell.references().iter().find(|&&r| r >= stage) {
                return Err(SpecErr::ForwardReference { stage, reference });
            }

            match cell {
                CellDescriptor::Filter { filters, .. } if filters.is_empty() => {
                    return Err(SpecErr::EmptyFilters { stage });
                }
                CellDescriptor::Filter {
                    filters, outputs, ..
                } if *outputs < filters.len() => {
                    return Err(SpecErr::OutputsTooSmall {
                        stage,
                        outputs: *outputs,
                        filters: filters.len(),
                    });
                }
                CellDescriptor::Widener2 { inputs } if inputs.is_empty() => {
                    return Err(SpecErr::EmptyWidenerInputs { stage });
                }
                _ => {}
            }
        }

        Ok(Self { cells })
    }

    /// Returns the amount of descriptors.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Returns the amount of width doubling stages.
    pub fn wideners(&self) -> usize {
        self.cells.iter().filter(|c| c.is_widener()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CellDescriptor> {
        self.cells.iter()
    }
}

impl TryFrom<Vec<CellDescriptor>> for ArchSpec {
    type Error = SpecErr;

    fn try_from(cells: Vec<CellDescriptor>) -> Result<Self> {
        Self::new(cells)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: Value) -> std::result::Result<CellDescriptor, serde_json::Error> {
        serde_json::from_value(value)
    }

    #[test]
    fn filter_cell_defaults_to_previous_stage() {
        let cell = parse(json!({"filters": {"conv3x3": {}}, "outputs": 64})).unwrap();

        let CellDescriptor::Filter {
            filters,
            outputs,
            inputs,
        } = cell
        else {
            panic!("expected a filter cell");
        };

        assert_eq!(outputs, 64);
        assert_eq!(filters.len(), 1);
        assert_eq!(inputs, InputSelection::Previous);
    }

    #[test]
    fn filter_order_follows_the_document() {
        let cell = parse(json!({
            "filters": {"conv5x5": {}, "conv1x1": {}, "maxpool3x3": {}},
            "outputs": 96,
            "inputs": "all"
        }))
        .unwrap();

        let CellDescriptor::Filter {
            filters, inputs, ..
        } = cell
        else {
            panic!("expected a filter cell");
        };

        let names: Vec<_> = filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["conv5x5", "conv1x1", "maxpool3x3"]);
        assert_eq!(inputs, InputSelection::All);
    }

    #[test]
    fn explicit_stage_lists_are_parsed() {
        let cell = parse(json!({"filters": {"conv3x3": {}}, "outputs": 8, "inputs": [0, 2]}))
            .unwrap();
        assert_eq!(cell.references(), [0, 2]);

        let cell = parse(json!({"widener2": {}, "inputs": [1, 3]})).unwrap();
        assert_eq!(cell, CellDescriptor::Widener2 { inputs: vec![1, 3] });
    }

    #[test]
    fn wideners_and_outputs_are_recognized() {
        assert_eq!(parse(json!({"widener": {}})).unwrap(), CellDescriptor::Widener);
        assert_eq!(parse(json!({"outputs": 10})).unwrap(), CellDescriptor::Output);
    }

    #[test]
    fn unknown_shapes_are_rejected() {
        let err = parse(json!({"shrinker": {}})).unwrap_err();
        assert!(err.to_string().contains("unrecognized cell descriptor"));

        let err = parse(json!({"filters": {"conv3x3": {}}, "outputs": 8, "inputs": "some"}))
            .unwrap_err();
        assert!(err.to_string().contains("invalid inputs selector"));
    }

    #[test]
    fn forward_references_are_rejected() {
        let cells = [
            CellDescriptor::Widener,
            CellDescriptor::Filter {
                filters: FilterSet::named(["conv3x3"]),
                outputs: 16,
                inputs: InputSelection::Stages(vec![0, 2]),
            },
        ];

        assert_eq!(
            ArchSpec::new(cells),
            Err(SpecErr::ForwardReference {
                stage: 2,
                reference: 2
            })
        );
    }

    #[test]
    fn malformed_cells_are_rejected() {
        let empty = CellDescriptor::Filter {
            filters: FilterSet::default(),
            outputs: 16,
            inputs: InputSelection::Previous,
        };
        assert_eq!(
            ArchSpec::new([empty]),
            Err(SpecErr::EmptyFilters { stage: 1 })
        );

        let narrow = CellDescriptor::Filter {
            filters: FilterSet::named(["conv1x1", "conv3x3", "conv5x5"]),
            outputs: 2,
            inputs: InputSelection::Previous,
        };
        assert!(matches!(
            ArchSpec::new([narrow]),
            Err(SpecErr::OutputsTooSmall { stage: 1, .. })
        ));

        let widener = CellDescriptor::Widener2 { inputs: vec![] };
        assert_eq!(
            ArchSpec::new([CellDescriptor::Widener, widener]),
            Err(SpecErr::EmptyWidenerInputs { stage: 2 })
        );
    }

    #[test]
    fn arch_deserializes_and_validates() {
        let arch: ArchSpec = serde_json::from_value(json!([
            {"filters": {"conv3x3": {}}, "outputs": 16},
            {"widener": {}},
            {"filters": {"conv3x3": {}}, "outputs": 32, "inputs": [0, 2]},
            {"outputs": 10}
        ]))
        .unwrap();

        assert_eq!(arch.len(), 4);
        assert_eq!(arch.wideners(), 1);

        let err = serde_json::from_value::<ArchSpec>(json!([
            {"filters": {"conv3x3": {}}, "outputs": 16, "inputs": [1]}
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("only earlier stages"));
    }
}
