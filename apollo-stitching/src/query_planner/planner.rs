//! Splits an operation between the subgraphs owning its fields.
//!
//! Every selection set is planned once per concrete type it can resolve to. Fields the parent
//! subgraph can resolve stay in the parent request; the others become follow-up fetches recorded
//! in the [`StitchTree`] under the response key they live below.

use std::sync::Arc;

use indexmap::IndexMap;
use indexmap::IndexSet;

use super::FieldPlan;
use super::Plan;
use super::QUERY_PLANNING_SPAN_NAME;
use super::QueryPlan;
use super::StitchTree;
use super::SubPlan;
use super::TYPENAME_MARKER;
use crate::error::PlanningError;
use crate::error::QueryPlannerError;
use crate::spec::Directive;
use crate::spec::Field;
use crate::spec::Fragments;
use crate::spec::InlineFragment;
use crate::spec::Operation;
use crate::spec::Selection;
use crate::spec::SelectionSet;
use crate::spec::SubgraphName;
use crate::spec::TYPENAME;
use crate::spec::TypeDefinition;
use crate::spec::UnifiedSchema;

/// Builds [`QueryPlan`]s against one unified schema.
#[derive(Clone)]
pub(crate) struct QueryPlanner {
    schema: Arc<dyn UnifiedSchema>,
}

impl QueryPlanner {
    pub(crate) fn new(schema: Arc<dyn UnifiedSchema>) -> Self {
        Self { schema }
    }

    pub(crate) fn plan(&self, operation: Arc<Operation>) -> Result<QueryPlan, QueryPlannerError> {
        let span = tracing::info_span!(
            QUERY_PLANNING_SPAN_NAME,
            "graphql.operation.kind" = %operation.kind,
            "graphql.operation.name" = operation.name.as_deref().unwrap_or_default(),
            "otel.kind" = "INTERNAL"
        );
        let _guard = span.enter();

        let root_type = self.schema.root_type(operation.kind).ok_or_else(|| {
            QueryPlannerError::Routing {
                reason: format!("the schema does not define a {} root type", operation.kind),
            }
        })?;

        let planner = Planner {
            schema: self.schema.as_ref(),
            fragments: &operation.fragments,
        };
        let collected = planner.collect(&operation.selection_set, root_type)?;
        let split = planner.split(&collected, root_type, None)?;
        tracing::debug!(
            subgraphs = split.plan.len(),
            stitch_points = split.stitch_tree.len(),
            "query planned"
        );

        Ok(QueryPlan {
            kind: operation.kind,
            root: SubPlan {
                plan: split.plan,
                stitch_tree: split.stitch_tree,
            },
            operation,
        })
    }
}

struct Planner<'a> {
    schema: &'a dyn UnifiedSchema,
    fragments: &'a Fragments,
}

/// A selection once fragments are resolved for one concrete type.
enum Collected<'a> {
    Field(&'a Field),
    /// Selections under directives that must survive, such as `@include` or `@defer`.
    Conditional {
        directives: &'a [Directive],
        selections: Vec<Collected<'a>>,
    },
}

#[derive(Default)]
struct Split {
    /// Selections resolved by the parent subgraph.
    own: SelectionSet,
    /// Selections other subgraphs must resolve.
    plan: Plan,
    stitch_tree: StitchTree,
}

impl<'a> Planner<'a> {
    /// Resolves fragments applying to `concrete` and drops the others.
    fn collect(
        &self,
        selections: &'a [Selection],
        concrete: &str,
    ) -> Result<Vec<Collected<'a>>, PlanningError> {
        let mut visited = IndexSet::new();
        let mut collected = Vec::new();
        self.collect_into(selections, concrete, &mut visited, &mut collected)?;
        Ok(collected)
    }

    fn collect_into(
        &self,
        selections: &'a [Selection],
        concrete: &str,
        visited: &mut IndexSet<&'a str>,
        collected: &mut Vec<Collected<'a>>,
    ) -> Result<(), PlanningError> {
        for selection in selections {
            let (directives, selection_set) = match selection {
                Selection::Field(field) => {
                    collected.push(Collected::Field(field));
                    continue;
                }
                Selection::InlineFragment(fragment) => {
                    if let Some(type_condition) = &fragment.type_condition {
                        if !self.applies_to(type_condition, concrete)? {
                            continue;
                        }
                    }
                    (&fragment.directives, &fragment.selection_set)
                }
                Selection::FragmentSpread(spread) => {
                    if !visited.insert(spread.fragment_name.as_str()) {
                        continue;
                    }
                    let fragment = self
                        .fragments
                        .get(&spread.fragment_name)
                        .ok_or_else(|| PlanningError::UnknownFragment(spread.fragment_name.clone()))?;
                    if !self.applies_to(&fragment.type_condition, concrete)? {
                        continue;
                    }
                    (&spread.directives, &fragment.selection_set)
                }
            };

            if directives.is_empty() {
                self.collect_into(selection_set, concrete, visited, collected)?;
            } else {
                let mut selections = Vec::new();
                self.collect_into(selection_set, concrete, visited, &mut selections)?;
                collected.push(Collected::Conditional {
                    directives,
                    selections,
                });
            }
        }
        Ok(())
    }

    fn applies_to(&self, type_condition: &str, concrete: &str) -> Result<bool, PlanningError> {
        let ty = self
            .schema
            .type_by_name(type_condition)
            .ok_or_else(|| PlanningError::UnknownType(type_condition.to_string()))?;
        if !ty.kind.is_composite() {
            return Err(PlanningError::InvalidTypeCondition {
                type_condition: type_condition.to_string(),
            });
        }
        Ok(type_condition == concrete
            || self
                .schema
                .possible_types(type_condition)
                .iter()
                .any(|possible| possible == concrete))
    }

    /// Partitions `collected` between `parent` and the other owners.
    ///
    /// At the root there is no parent and every field goes to the plan.
    fn split(
        &self,
        collected: &[Collected<'a>],
        concrete: &str,
        parent: Option<&str>,
    ) -> Result<Split, QueryPlannerError> {
        let mut split = Split::default();
        for item in collected {
            match item {
                Collected::Field(field) => self.split_field(*field, concrete, parent, &mut split)?,
                Collected::Conditional {
                    directives,
                    selections,
                } => {
                    let inner = self.split(selections, concrete, parent)?;
                    if !inner.own.is_empty() {
                        split.own.push(conditional(directives, inner.own));
                    }
                    for (subgraph, selections) in inner.plan {
                        split
                            .plan
                            .entry(subgraph)
                            .or_default()
                            .push(conditional(directives, selections));
                    }
                    for (key, field_plan) in inner.stitch_tree {
                        split.stitch_tree.entry(key).or_default().merge(field_plan);
                    }
                }
            }
        }
        Ok(split)
    }

    fn split_field(
        &self,
        field: &'a Field,
        concrete: &str,
        parent: Option<&str>,
        split: &mut Split,
    ) -> Result<(), QueryPlannerError> {
        if field.name == TYPENAME && parent.is_some() {
            split.own.push(Selection::Field(field.clone()));
            return Ok(());
        }

        let owners = self.schema.owners_of(concrete, &field.name);
        let Some(subgraph) = choose_subgraph(owners, parent, &split.plan) else {
            if parent.is_none() {
                return Err(QueryPlannerError::Routing {
                    reason: format!(
                        "no subgraph can resolve field '{concrete}.{}'",
                        field.name
                    ),
                });
            }
            tracing::debug!(
                type_name = concrete,
                field_name = field.name.as_str(),
                "no subgraph owns this field, dropping it"
            );
            return Ok(());
        };

        let selection = match &field.selection_set {
            Some(selections) => {
                let (selection_set, field_plan) =
                    self.plan_field(field, selections, concrete, subgraph)?;
                if let Some(field_plan) = field_plan {
                    split
                        .stitch_tree
                        .entry(field.response_key().to_string())
                        .or_default()
                        .merge(field_plan);
                }
                Field {
                    selection_set: Some(selection_set),
                    ..field.clone()
                }
            }
            None => field.clone(),
        };

        if Some(subgraph) == parent {
            split.own.push(Selection::Field(selection));
        } else {
            split
                .plan
                .entry(subgraph.to_string())
                .or_default()
                .push(Selection::Field(selection));
        }
        Ok(())
    }

    /// Plans the sub-selections of a composite field fetched from `subgraph`.
    ///
    /// Returns the selection set to send to `subgraph` and the follow-up fetches, if any.
    fn plan_field(
        &self,
        field: &Field,
        selections: &'a [Selection],
        parent_type: &str,
        subgraph: &str,
    ) -> Result<(SelectionSet, Option<FieldPlan>), QueryPlannerError> {
        let return_type = self.field_type(parent_type, &field.name)?;
        if !return_type.kind.is_composite() {
            return Ok((selections.to_vec(), None));
        }
        let is_abstract = return_type.kind.is_abstract();
        let concrete_types: Vec<&str> = if is_abstract {
            self.schema
                .possible_types(&return_type.name)
                .iter()
                .map(String::as_str)
                .collect()
        } else {
            vec![return_type.name.as_str()]
        };

        let mut by_type = IndexMap::new();
        let mut own = SelectionSet::new();
        for concrete in concrete_types {
            let collected = self.collect(selections, concrete)?;
            let split = self.split(&collected, concrete, Some(subgraph))?;
            let sub_plan = SubPlan {
                plan: split.plan,
                stitch_tree: split.stitch_tree,
            };
            if !sub_plan.is_empty() {
                by_type.insert(concrete.to_string(), sub_plan);
            }
            if !is_abstract {
                own = split.own;
            } else if !split.own.is_empty()
                && self
                    .schema
                    .owners_of(concrete, TYPENAME)
                    .iter()
                    .any(|owner| owner == subgraph)
            {
                own.push(Selection::InlineFragment(InlineFragment {
                    type_condition: Some(concrete.to_string()),
                    directives: Vec::new(),
                    selection_set: split.own,
                }));
            }
        }

        let mut selection_set = SelectionSet::new();
        if is_abstract && !by_type.is_empty() {
            selection_set.push(Selection::Field(Field::leaf(
                Some(TYPENAME_MARKER),
                TYPENAME,
            )));
        }
        selection_set.extend(own);
        if selection_set.is_empty() {
            // a composite field needs a sub-selection, the marker never reaches the client
            selection_set.push(Selection::Field(Field::leaf(
                Some(TYPENAME_MARKER),
                TYPENAME,
            )));
        }

        Ok((
            selection_set,
            (!by_type.is_empty()).then_some(FieldPlan {
                by_type,
                is_abstract,
            }),
        ))
    }

    fn field_type(
        &self,
        parent_type: &str,
        field_name: &str,
    ) -> Result<&'a TypeDefinition, PlanningError> {
        let type_name = self
            .schema
            .type_by_name(parent_type)
            .and_then(|ty| ty.fields.get(field_name))
            .map(|field| field.type_name.as_str())
            .ok_or_else(|| PlanningError::UnknownType(format!("{parent_type}.{field_name}")))?;
        self.schema
            .type_by_name(type_name)
            .ok_or_else(|| PlanningError::UnknownType(type_name.to_string()))
    }
}

/// Prefers the parent, then a subgraph already fetched from at this level, then the first owner.
fn choose_subgraph<'s>(
    owners: &'s [SubgraphName],
    parent: Option<&str>,
    plan: &Plan,
) -> Option<&'s str> {
    owners
        .iter()
        .find(|owner| Some(owner.as_str()) == parent)
        .or_else(|| owners.iter().find(|owner| plan.contains_key(owner.as_str())))
        .or_else(|| owners.first())
        .map(String::as_str)
}

fn conditional(directives: &[Directive], selection_set: SelectionSet) -> Selection {
    Selection::InlineFragment(InlineFragment {
        type_condition: None,
        directives: directives.to_vec(),
        selection_set,
    })
}
