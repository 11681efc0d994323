//! Query planning: which subgraph fetches what, and where follow-up fetches are needed.

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde::Serializer;
use serde::ser::SerializeMap;

pub(crate) use self::caching_query_planner::*;
pub(crate) use self::execution::*;
pub(crate) use self::planner::*;
use crate::spec::Operation;
use crate::spec::OperationKind;
use crate::spec::SelectionSet;
use crate::spec::SubgraphName;
use crate::spec::operation::DisplaySelectionSet;

mod caching_query_planner;
mod execution;
mod planner;

pub(crate) const QUERY_PLANNING_SPAN_NAME: &str = "query_planning";
pub(crate) const EXECUTION_SPAN_NAME: &str = "execution";
pub(crate) const FETCH_SPAN_NAME: &str = "fetch";
pub(crate) const STITCH_SPAN_NAME: &str = "stitch";
pub(crate) const SUBSCRIPTION_EVENT_SPAN_NAME: &str = "subscription_event";

/// Alias of the `__typename` selections the planner injects, stripped from every response.
pub const TYPENAME_MARKER: &str = "__stitching__typename";

/// Subgraph to the selections it must resolve for one response position.
pub type Plan = IndexMap<SubgraphName, SelectionSet>;

/// Response key to the follow-up fetches needed below it.
pub type StitchTree = IndexMap<String, FieldPlan>;

/// Follow-up fetches for one response key, by concrete type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FieldPlan {
    pub by_type: IndexMap<String, SubPlan>,
    /// The field returns an interface or a union, its objects carry [`TYPENAME_MARKER`].
    #[serde(skip)]
    pub is_abstract: bool,
}

impl FieldPlan {
    pub(crate) fn merge(&mut self, other: FieldPlan) {
        self.is_abstract |= other.is_abstract;
        for (type_name, sub_plan) in other.by_type {
            self.by_type.entry(type_name).or_default().merge(sub_plan);
        }
    }
}

/// Fetches for an object of a known type, and what to do below it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubPlan {
    #[serde(serialize_with = "serialize_plan")]
    pub plan: Plan,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub stitch_tree: StitchTree,
}

impl SubPlan {
    pub fn is_empty(&self) -> bool {
        self.plan.is_empty() && self.stitch_tree.is_empty()
    }

    pub(crate) fn merge(&mut self, other: SubPlan) {
        for (subgraph, selections) in other.plan {
            self.plan.entry(subgraph).or_default().extend(selections);
        }
        for (key, field_plan) in other.stitch_tree {
            self.stitch_tree.entry(key).or_default().merge(field_plan);
        }
    }
}

fn serialize_plan<S: Serializer>(plan: &Plan, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(plan.len()))?;
    for (subgraph, selections) in plan {
        map.serialize_entry(subgraph, &DisplaySelectionSet(selections).to_string())?;
    }
    map.end()
}

/// A planned operation, as stored in the plan cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryPlan {
    pub kind: OperationKind,
    pub root: SubPlan,
    #[serde(skip)]
    pub operation: Arc<Operation>,
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        writeln!(out, "QueryPlan({}) {{", self.kind)?;
        write_sub_plan(&mut out, &self.root, 1)?;
        out.push('}');
        f.write_str(&out)
    }
}

fn write_sub_plan(out: &mut String, sub_plan: &SubPlan, depth: usize) -> fmt::Result {
    let indent = "  ".repeat(depth);
    for (subgraph, selections) in &sub_plan.plan {
        writeln!(
            out,
            "{indent}Fetch(service: \"{subgraph}\") {}",
            DisplaySelectionSet(selections)
        )?;
    }
    for (key, field_plan) in &sub_plan.stitch_tree {
        writeln!(out, "{indent}Stitch({key}) {{")?;
        for (type_name, sub_plan) in &field_plan.by_type {
            writeln!(out, "{indent}  {type_name} {{")?;
            write_sub_plan(out, sub_plan, depth + 2)?;
            writeln!(out, "{indent}  }}")?;
        }
        writeln!(out, "{indent}}}")?;
    }
    Ok(())
}
