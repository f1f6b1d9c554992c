//! Mechanism identifiers and the group plan that partitions them across fusions.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Number of persuasion mechanisms carried by every output record.
pub const MECHANISM_COUNT: u8 = 8;

const MECHANISM_NAMES: [&str; MECHANISM_COUNT as usize] = [
    "Fear Of Missing Out",
    "Gain Appeal",
    "Information Gap",
    "Anomaly and Novelty",
    "Perceptual Contrast",
    "Ingroup Identification / Outgroup Distinction",
    "Social Comparison",
    "Authority Endorsement",
];

/// Errors raised while building or parsing a [`GroupPlan`].
#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    /// Mechanism number outside `1..=8`.
    #[error("mechanism {0} is outside 1..=8")]
    InvalidMechanism(u32),
    /// Fusion weights that cannot produce a direction.
    #[error("invalid fusion weights text={text} image={image}")]
    InvalidWeights {
        /// Requested text weight.
        text: f32,
        /// Requested image weight.
        image: f32,
    },
    /// A group with no mechanisms.
    #[error("group '{0}' has no mechanisms")]
    EmptyGroup(String),
    /// Two groups share a name.
    #[error("group name '{0}' is used more than once")]
    DuplicateName(String),
    /// A mechanism assigned to more than one group.
    #[error("mechanism {0} is assigned to more than one group")]
    Overlap(Mechanism),
    /// A mechanism assigned to no group.
    #[error("mechanism {0} is not assigned to any group")]
    Gap(Mechanism),
    /// Malformed plan string.
    #[error("invalid group plan syntax: {0}")]
    Syntax(String),
}

/// One of the eight persuasion mechanisms, numbered `1..=8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mechanism(u8);

impl Mechanism {
    /// Validates and wraps a mechanism number.
    pub fn new(number: u8) -> Result<Self, PlanError> {
        if (1..=MECHANISM_COUNT).contains(&number) {
            Ok(Self(number))
        } else {
            Err(PlanError::InvalidMechanism(number as u32))
        }
    }

    /// All mechanisms in ascending order.
    pub fn all() -> impl Iterator<Item = Mechanism> {
        (1..=MECHANISM_COUNT).map(Mechanism)
    }

    /// Mechanism number (`1..=8`).
    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero-based slot used by fixed-size label arrays.
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    /// Response/output key, e.g. `h3`.
    pub fn key(self) -> String {
        format!("h{}", self.0)
    }

    /// Human-readable mechanism name.
    pub fn name(self) -> &'static str {
        MECHANISM_NAMES[self.index()]
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Weight pair applied when fusing a text and an image embedding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    text: f32,
    image: f32,
}

impl FusionWeights {
    /// Text-heavy fusion used for semantically driven mechanisms.
    pub const TEXT_HEAVY: Self = Self {
        text: 0.8,
        image: 0.2,
    };
    /// Balanced fusion used for visually driven mechanisms.
    pub const BALANCED: Self = Self {
        text: 0.5,
        image: 0.5,
    };

    /// Builds a weight pair; both must be finite, non-negative and not both zero.
    pub fn new(text: f32, image: f32) -> Result<Self, PlanError> {
        let valid = text.is_finite()
            && image.is_finite()
            && text >= 0.0
            && image >= 0.0
            && (text > 0.0 || image > 0.0);
        if valid {
            Ok(Self { text, image })
        } else {
            Err(PlanError::InvalidWeights { text, image })
        }
    }

    /// Weight applied to the text embedding.
    pub fn text(&self) -> f32 {
        self.text
    }

    /// Weight applied to the image embedding.
    pub fn image(&self) -> f32 {
        self.image
    }
}

impl fmt::Display for FusionWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.text, self.image)
    }
}

/// Named subset of mechanisms bound to one fusion variant.
#[derive(Debug, Clone, PartialEq)]
pub struct MechanismGroup {
    name: String,
    mechanisms: Vec<Mechanism>,
    weights: FusionWeights,
}

impl MechanismGroup {
    /// Builds a group; mechanisms are sorted and deduplicated.
    pub fn new(
        name: impl Into<String>,
        mechanisms: impl IntoIterator<Item = Mechanism>,
        weights: FusionWeights,
    ) -> Result<Self, PlanError> {
        let name = name.into();
        let mechanisms: Vec<Mechanism> = mechanisms
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if mechanisms.is_empty() {
            return Err(PlanError::EmptyGroup(name));
        }
        Ok(Self {
            name,
            mechanisms,
            weights,
        })
    }

    /// Group label used in logs and in the merged reasoning text.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mechanisms owned by this group, ascending.
    pub fn mechanisms(&self) -> &[Mechanism] {
        &self.mechanisms
    }

    /// Fusion weights used to build this group's query vectors.
    pub fn weights(&self) -> FusionWeights {
        self.weights
    }
}

/// Ordered set of groups that partitions all eight mechanisms.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPlan {
    groups: Vec<MechanismGroup>,
}

impl GroupPlan {
    /// Validates that `groups` cover every mechanism exactly once.
    pub fn new(groups: Vec<MechanismGroup>) -> Result<Self, PlanError> {
        let mut names = BTreeSet::new();
        let mut seen = BTreeSet::new();
        for group in &groups {
            if !names.insert(group.name.as_str()) {
                return Err(PlanError::DuplicateName(group.name.clone()));
            }
            for &mechanism in &group.mechanisms {
                if !seen.insert(mechanism) {
                    return Err(PlanError::Overlap(mechanism));
                }
            }
        }
        if let Some(missing) = Mechanism::all().find(|m| !seen.contains(m)) {
            return Err(PlanError::Gap(missing));
        }
        Ok(Self { groups })
    }

    /// Two-group plan: semantic mechanisms on the text-heavy fusion, visual ones balanced.
    pub fn default_rag() -> Self {
        Self {
            groups: vec![
                MechanismGroup {
                    name: "semantic-heavy".to_string(),
                    mechanisms: [1, 2, 3, 4, 6].into_iter().map(Mechanism).collect(),
                    weights: FusionWeights::TEXT_HEAVY,
                },
                MechanismGroup {
                    name: "balanced-visual".to_string(),
                    mechanisms: [5, 7, 8].into_iter().map(Mechanism).collect(),
                    weights: FusionWeights::BALANCED,
                },
            ],
        }
    }

    /// Single group with every mechanism, used when no retrieval happens.
    pub fn single() -> Self {
        Self {
            groups: vec![MechanismGroup {
                name: "all".to_string(),
                mechanisms: Mechanism::all().collect(),
                weights: FusionWeights::BALANCED,
            }],
        }
    }

    /// Groups in evaluation order.
    pub fn groups(&self) -> &[MechanismGroup] {
        &self.groups
    }

    /// Distinct fusion weight pairs, in first-use order.
    pub fn distinct_weights(&self) -> Vec<FusionWeights> {
        let mut out: Vec<FusionWeights> = Vec::new();
        for group in &self.groups {
            if !out.contains(&group.weights) {
                out.push(group.weights);
            }
        }
        out
    }
}

impl Default for GroupPlan {
    fn default() -> Self {
        Self::default_rag()
    }
}

/// Parses `name=1,2,3@0.8:0.2;other=4,5,6,7,8@0.5:0.5`. Names are optional.
impl FromStr for GroupPlan {
    type Err = PlanError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut groups = Vec::new();
        for (idx, raw) in input
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .enumerate()
        {
            let (name, body) = match raw.split_once('=') {
                Some((name, body)) => (name.trim().to_string(), body),
                None => (format!("group-{}", idx + 1), raw),
            };
            let (members, weights) = body
                .split_once('@')
                .ok_or_else(|| PlanError::Syntax(format!("'{raw}' is missing '@text:image'")))?;
            let (text, image) = weights
                .split_once(':')
                .ok_or_else(|| PlanError::Syntax(format!("'{weights}' is not 'text:image'")))?;
            let text: f32 = text
                .trim()
                .parse()
                .map_err(|_| PlanError::Syntax(format!("bad text weight '{text}'")))?;
            let image: f32 = image
                .trim()
                .parse()
                .map_err(|_| PlanError::Syntax(format!("bad image weight '{image}'")))?;
            let mut mechanisms = Vec::new();
            for member in members.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let number: u32 = member
                    .trim_start_matches('h')
                    .parse()
                    .map_err(|_| PlanError::Syntax(format!("bad mechanism '{member}'")))?;
                let number =
                    u8::try_from(number).map_err(|_| PlanError::InvalidMechanism(number))?;
                mechanisms.push(Mechanism::new(number)?);
            }
            groups.push(MechanismGroup::new(
                name,
                mechanisms,
                FusionWeights::new(text, image)?,
            )?);
        }
        if groups.is_empty() {
            return Err(PlanError::Syntax("no groups given".to_string()));
        }
        Self::new(groups)
    }
}

/// Renders the same syntax [`GroupPlan::from_str`] accepts.
impl fmt::Display for GroupPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, group) in self.groups.iter().enumerate() {
            if idx > 0 {
                f.write_str(";")?;
            }
            let members: Vec<String> = group
                .mechanisms
                .iter()
                .map(|m| m.number().to_string())
                .collect();
            write!(f, "{}={}@{}", group.name, members.join(","), group.weights)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn m(n: u8) -> Mechanism {
        Mechanism::new(n).expect("valid mechanism")
    }

    #[test]
    fn default_plan_partitions_all_mechanisms() {
        let plan = GroupPlan::default_rag();
        let mut union = BTreeSet::new();
        for group in plan.groups() {
            for mechanism in group.mechanisms() {
                assert!(union.insert(*mechanism), "{mechanism} appears twice");
            }
        }
        assert_eq!(union, Mechanism::all().collect::<BTreeSet<_>>());
        assert_eq!(GroupPlan::new(plan.groups().to_vec()), Ok(plan));
    }

    #[test]
    fn overlapping_groups_rejected() {
        let a = MechanismGroup::new("a", [1, 2, 3, 4].map(m), FusionWeights::TEXT_HEAVY).unwrap();
        let b = MechanismGroup::new("b", [4, 5, 6, 7, 8].map(m), FusionWeights::BALANCED).unwrap();
        assert_eq!(GroupPlan::new(vec![a, b]), Err(PlanError::Overlap(m(4))));
    }

    #[test]
    fn gaps_rejected() {
        let a = MechanismGroup::new("a", [1, 2, 3].map(m), FusionWeights::TEXT_HEAVY).unwrap();
        let b = MechanismGroup::new("b", [5, 6, 7, 8].map(m), FusionWeights::BALANCED).unwrap();
        assert_eq!(GroupPlan::new(vec![a, b]), Err(PlanError::Gap(m(4))));
    }

    #[test]
    fn parses_plan_string() {
        let plan: GroupPlan = "semantic-heavy=1,2,3,4,6@0.8:0.2; balanced-visual=h5,h7,h8@0.5:0.5"
            .parse()
            .expect("plan parses");
        assert_eq!(plan, GroupPlan::default_rag());
        assert_eq!(
            plan.to_string(),
            "semantic-heavy=1,2,3,4,6@0.8:0.2;balanced-visual=5,7,8@0.5:0.5"
        );
        assert_eq!(plan.distinct_weights().len(), 2);
    }

    #[test]
    fn unnamed_groups_get_positional_names() {
        let plan: GroupPlan = "1,2,3,4@1:0;5,6,7,8@0:1".parse().expect("plan parses");
        let names: Vec<&str> = plan.groups().iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["group-1", "group-2"]);
    }

    #[test]
    fn rejects_out_of_range_mechanisms_and_bad_weights() {
        assert_eq!(
            "1,2,3,4,5,6,7,8,9@0.5:0.5".parse::<GroupPlan>(),
            Err(PlanError::InvalidMechanism(9))
        );
        assert!(matches!(
            "1,2,3,4,5,6,7,8@0:0".parse::<GroupPlan>(),
            Err(PlanError::InvalidWeights { .. })
        ));
        assert!(matches!(
            "1,2,3,4,5,6,7,8".parse::<GroupPlan>(),
            Err(PlanError::Syntax(_))
        ));
    }
}
