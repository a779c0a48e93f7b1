use crate::job::{JobDescriptor, Kwargs, Value};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// A single job argument, either a fixed value or a set of candidates to sweep over
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(from = "RawArg", into = "RawArg")]
pub enum Arg {
    Fixed(Value),
    Swept(Vec<Value>),
}

/// key of the only entry of a swept argument in sweep files: `{permute: [..]}`
pub const PERMUTE_KEY: &str = "permute";

#[derive(Deserialize, Serialize)]
#[serde(transparent)]
struct RawArg(Value);

impl From<RawArg> for Arg {
    fn from(RawArg(value): RawArg) -> Self {
        if let Value::Object(map) = &value {
            if let (1, Some(Value::Array(candidates))) = (map.len(), map.get(PERMUTE_KEY)) {
                return Self::Swept(candidates.clone());
            }
        }

        Self::Fixed(value)
    }
}

impl From<Arg> for RawArg {
    fn from(arg: Arg) -> Self {
        match arg {
            Arg::Swept(candidates) => {
                let mut map = serde_json::Map::new();
                map.insert(PERMUTE_KEY.to_owned(), Value::Array(candidates));

                Self(Value::Object(map))
            }
            Arg::Fixed(value) => Self(value),
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Fixed(value)
    }
}

impl Arg {
    pub fn fixed(value: impl Into<Value>) -> Self {
        Self::Fixed(value.into())
    }

    /// sweep over all `values`, one job per candidate
    pub fn permute<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::Swept(values.into_iter().map(Into::into).collect())
    }

    pub fn is_swept(&self) -> bool {
        matches!(self, Self::Swept(_))
    }
}

/// A call to a work unit, possibly containing swept arguments
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    #[serde(alias = "unit")]
    pub work_unit: String,
    #[serde(default)]
    pub args: Vec<Arg>,
    #[serde(default)]
    pub kwargs: IndexMap<String, Arg>,
}

impl JobSpec {
    pub fn new(work_unit: impl Into<String>) -> Self {
        Self {
            work_unit: work_unit.into(),
            args: Vec::new(),
            kwargs: IndexMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.kwargs.insert(name.into(), arg.into());
        self
    }

    /// Expand into one descriptor per element of the cartesian product of all swept arguments
    ///
    /// Swept slots are ordered positional first, then keywords in insertion order, and the last
    /// slot varies fastest. Without swept arguments exactly one descriptor is returned, a sweep
    /// over an empty candidate list yields none.
    pub fn expand(&self) -> Vec<JobDescriptor> {
        let slots = self
            .args
            .iter()
            .chain(self.kwargs.values())
            .filter_map(|arg| match arg {
                Arg::Swept(candidates) => Some(candidates.iter()),
                Arg::Fixed(_) => None,
            })
            .collect_vec();

        // multi_cartesian_product of nothing is empty, not a single empty combination
        if slots.is_empty() {
            return vec![self.instantiate(&[])];
        }

        slots
            .into_iter()
            .multi_cartesian_product()
            .map(|combination| self.instantiate(&combination))
            .collect()
    }

    /// build a descriptor, filling swept slots from `combination` in order
    fn instantiate(&self, combination: &[&Value]) -> JobDescriptor {
        let mut picks = combination.iter().map(|value| (*value).clone());
        let mut resolve = |arg: &Arg| match arg {
            Arg::Fixed(value) => value.clone(),
            Arg::Swept(_) => picks.next().unwrap_or(Value::Null),
        };

        let args = self.args.iter().map(&mut resolve).collect_vec();
        let kwargs = self
            .kwargs
            .iter()
            .map(|(name, arg)| (name.clone(), resolve(arg)))
            .collect::<Kwargs>();

        JobDescriptor::new(self.work_unit.clone(), args, kwargs)
    }
}
