use serde::{Deserialize, Serialize};

use crate::error::AutoMlError;

/// Named subsets of a provider's catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alias {
    All,
    Defaults,
    Grids,
}

/// An explicit step id with optional scheduling overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOverride {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl StepOverride {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: None,
            weight: None,
        }
    }

    pub fn with_group(mut self, group: u32) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Alias(Alias),
    Ids(Vec<String>),
    Steps(Vec<StepOverride>),
}

/// Which steps of one provider a modeling plan asks for.
///
/// Serialized as `{ name, alias }`, `{ name, ids }` or `{ name, steps }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStepRequest", into = "RawStepRequest")]
pub struct StepRequest {
    pub name: String,
    pub selector: Selector,
}

impl StepRequest {
    pub fn alias(name: impl Into<String>, alias: Alias) -> Self {
        Self {
            name: name.into(),
            selector: Selector::Alias(alias),
        }
    }

    pub fn ids<I, S>(name: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            selector: Selector::Ids(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn steps(name: impl Into<String>, steps: Vec<StepOverride>) -> Self {
        Self {
            name: name.into(),
            selector: Selector::Steps(steps),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStepRequest {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alias: Option<Alias>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    steps: Option<Vec<StepOverride>>,
}

impl TryFrom<RawStepRequest> for StepRequest {
    type Error = AutoMlError;

    fn try_from(raw: RawStepRequest) -> Result<Self, Self::Error> {
        let selector = match (raw.alias, raw.ids, raw.steps) {
            (Some(alias), None, None) => Selector::Alias(alias),
            (None, Some(ids), None) => Selector::Ids(ids),
            (None, None, Some(steps)) => Selector::Steps(steps),
            (None, None, None) => Selector::Alias(Alias::All),
            _ => {
                return Err(AutoMlError::InvalidArgument(format!(
                    "step request for '{}' must use only one of alias, ids or steps",
                    raw.name
                )));
            }
        };
        Ok(Self {
            name: raw.name,
            selector,
        })
    }
}

impl From<StepRequest> for RawStepRequest {
    fn from(req: StepRequest) -> Self {
        let mut raw = RawStepRequest {
            name: req.name,
            alias: None,
            ids: None,
            steps: None,
        };
        match req.selector {
            Selector::Alias(alias) => raw.alias = Some(alias),
            Selector::Ids(ids) => raw.ids = Some(ids),
            Selector::Steps(steps) => raw.steps = Some(steps),
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_selector_form() {
        let reqs: Vec<StepRequest> = serde_json::from_str(
            r#"[
                {"name": "GBM", "alias": "defaults"},
                {"name": "GLM", "ids": ["def_1"]},
                {"name": "DRF", "steps": [{"id": "XRT", "group": 3, "weight": 7}]},
                {"name": "DeepLearning"}
            ]"#,
        )
        .unwrap();
        assert_eq!(reqs[0], StepRequest::alias("GBM", Alias::Defaults));
        assert_eq!(reqs[1], StepRequest::ids("GLM", ["def_1"]));
        assert_eq!(
            reqs[2],
            StepRequest::steps("DRF", vec![StepOverride::new("XRT").with_group(3).with_weight(7)])
        );
        assert_eq!(reqs[3], StepRequest::alias("DeepLearning", Alias::All));
    }

    #[test]
    fn rejects_ambiguous_selector() {
        let err = serde_json::from_str::<StepRequest>(
            r#"{"name": "GBM", "alias": "all", "ids": ["def_1"]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("only one of alias, ids or steps"));
    }

    #[test]
    fn parses_toml_plan() {
        #[derive(Deserialize)]
        struct Plan {
            plan: Vec<StepRequest>,
        }
        let plan: Plan = toml::from_str(
            r#"
            [[plan]]
            name = "XGBoost"
            alias = "grids"

            [[plan]]
            name = "StackedEnsemble"
            ids = ["best_of_family"]
            "#,
        )
        .unwrap();
        assert_eq!(plan.plan.len(), 2);
        assert_eq!(plan.plan[0].selector, Selector::Alias(Alias::Grids));
    }

    #[test]
    fn serializes_back_to_compact_form() {
        let json = serde_json::to_string(&StepRequest::ids("GLM", ["def_1"])).unwrap();
        assert_eq!(json, r#"{"name":"GLM","ids":["def_1"]}"#);
    }
}
