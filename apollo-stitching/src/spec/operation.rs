//! The operation model the planner works on.
//!
//! Documents are parsed with apollo-compiler and converted into a small closed set of selection
//! kinds. No validation happens here: the document is assumed to be valid for the unified schema.

use std::fmt;

use apollo_compiler::ast;
use indexmap::IndexMap;
use indexmap::IndexSet;
use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;

use crate::spec::SpecError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ast::OperationType> for OperationKind {
    fn from(operation_type: ast::OperationType) -> Self {
        match operation_type {
            ast::OperationType::Query => OperationKind::Query,
            ast::OperationType::Mutation => OperationKind::Mutation,
            ast::OperationType::Subscription => OperationKind::Subscription,
        }
    }
}

impl From<OperationKind> for ast::OperationType {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Query => ast::OperationType::Query,
            OperationKind::Mutation => ast::OperationType::Mutation,
            OperationKind::Subscription => ast::OperationType::Subscription,
        }
    }
}

pub type SelectionSet = Vec<Selection>;

/// Fragment definitions of a document, by name.
pub type Fragments = IndexMap<String, FragmentDefinition>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind")]
pub enum Selection {
    Field(Field),
    InlineFragment(InlineFragment),
    FragmentSpread(FragmentSpread),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Argument>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<Directive>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_set: Option<SelectionSet>,
}

impl Field {
    /// A field without arguments nor sub-selections.
    pub fn leaf(alias: Option<&str>, name: &str) -> Self {
        Field {
            alias: alias.map(str::to_string),
            name: name.to_string(),
            arguments: Vec::new(),
            directives: Vec::new(),
            selection_set: None,
        }
    }

    /// The key this field is found under in the response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineFragment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_condition: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<Directive>,
    pub selection_set: SelectionSet,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSpread {
    pub fragment_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<Directive>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentDefinition {
    pub name: String,
    pub type_condition: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub directives: Vec<Directive>,
    pub selection_set: SelectionSet,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Argument {
    pub name: String,
    pub value: InputValue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Directive {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Argument>,
}

/// A literal or variable reference, as written in the document.
///
/// Numbers keep their source text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum InputValue {
    Null,
    Enum(String),
    Variable(String),
    String(String),
    Int(String),
    Float(String),
    Boolean(bool),
    List(Vec<InputValue>),
    Object(Vec<(String, InputValue)>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    pub name: String,
    /// The variable type as written, e.g. `[ID!]!`.
    pub ty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<InputValue>,
}

/// One executable operation of a document, along with the document's fragments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub kind: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableDefinition>,
    pub selection_set: SelectionSet,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub fragments: Fragments,
}

impl Operation {
    /// Parses `source` and selects the operation to run.
    ///
    /// Without `operation_name`, the document must contain exactly one operation.
    pub fn from_document(source: &str, operation_name: Option<&str>) -> Result<Self, SpecError> {
        let document = ast::Document::parse(source, "query.graphql")
            .map_err(|err| SpecError::ParsingError(err.errors.to_string()))?;

        let mut fragments = Fragments::new();
        let mut operations = Vec::new();
        for definition in document.definitions.iter() {
            match definition {
                ast::Definition::OperationDefinition(operation) => operations.push(operation),
                ast::Definition::FragmentDefinition(fragment) => {
                    fragments.insert(
                        fragment.name.to_string(),
                        FragmentDefinition {
                            name: fragment.name.to_string(),
                            type_condition: fragment.type_condition.to_string(),
                            directives: directives_from_ast(&fragment.directives),
                            selection_set: selection_set_from_ast(&fragment.selection_set),
                        },
                    );
                }
                _ => {}
            }
        }

        let operation = match operation_name {
            Some(name) => operations
                .into_iter()
                .find(|operation| operation.name.as_ref().is_some_and(|n| n.as_str() == name))
                .ok_or_else(|| SpecError::UnknownOperation(name.to_string()))?,
            None => match operations.len() {
                0 => return Err(SpecError::NoOperation),
                1 => operations.remove(0),
                _ => return Err(SpecError::MultipleOperationWithoutOperationName),
            },
        };

        Ok(Operation {
            kind: operation.operation_type.into(),
            name: operation.name.as_ref().map(|name| name.to_string()),
            variables: operation
                .variables
                .iter()
                .map(|variable| VariableDefinition {
                    name: variable.name.to_string(),
                    ty: variable.ty.to_string(),
                    default_value: variable
                        .default_value
                        .as_ref()
                        .map(|value| InputValue::from_ast(value)),
                })
                .collect(),
            selection_set: selection_set_from_ast(&operation.selection_set),
            fragments,
        })
    }

    /// Prints an operation document for `selections`.
    ///
    /// Only the variable definitions `selections` refers to are emitted.
    pub fn print_subrequest(&self, kind: OperationKind, selections: &[Selection]) -> String {
        let used = variables_used(selections);
        let definitions = self
            .variables
            .iter()
            .filter(|variable| used.contains(&variable.name))
            .map(|variable| variable.to_string())
            .join(", ");
        if definitions.is_empty() {
            format!("{kind} {}", DisplaySelectionSet(selections))
        } else {
            format!("{kind}({definitions}) {}", DisplaySelectionSet(selections))
        }
    }
}

/// The names of the variables referenced by `selections`, in order of appearance.
pub(crate) fn variables_used(selections: &[Selection]) -> IndexSet<String> {
    let mut used = IndexSet::new();
    collect_variables(selections, &mut used);
    used
}

fn collect_variables(selections: &[Selection], used: &mut IndexSet<String>) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                for argument in &field.arguments {
                    argument.value.collect_variables(used);
                }
                collect_directive_variables(&field.directives, used);
                if let Some(selection_set) = &field.selection_set {
                    collect_variables(selection_set, used);
                }
            }
            Selection::InlineFragment(fragment) => {
                collect_directive_variables(&fragment.directives, used);
                collect_variables(&fragment.selection_set, used);
            }
            Selection::FragmentSpread(spread) => {
                collect_directive_variables(&spread.directives, used);
            }
        }
    }
}

fn collect_directive_variables(directives: &[Directive], used: &mut IndexSet<String>) {
    for directive in directives {
        for argument in &directive.arguments {
            argument.value.collect_variables(used);
        }
    }
}

impl InputValue {
    fn from_ast(value: &ast::Value) -> Self {
        match value {
            ast::Value::Null => InputValue::Null,
            ast::Value::Enum(name) => InputValue::Enum(name.to_string()),
            ast::Value::Variable(name) => InputValue::Variable(name.to_string()),
            ast::Value::String(s) => InputValue::String(s.to_string()),
            ast::Value::Float(f) => InputValue::Float(f.as_str().to_string()),
            ast::Value::Int(i) => InputValue::Int(i.as_str().to_string()),
            ast::Value::Boolean(b) => InputValue::Boolean(*b),
            ast::Value::List(items) => {
                InputValue::List(items.iter().map(|item| InputValue::from_ast(item)).collect())
            }
            ast::Value::Object(fields) => InputValue::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.to_string(), InputValue::from_ast(value)))
                    .collect(),
            ),
        }
    }

    fn collect_variables(&self, used: &mut IndexSet<String>) {
        match self {
            InputValue::Variable(name) => {
                used.insert(name.clone());
            }
            InputValue::List(items) => items.iter().for_each(|item| item.collect_variables(used)),
            InputValue::Object(fields) => fields
                .iter()
                .for_each(|(_, value)| value.collect_variables(used)),
            _ => {}
        }
    }
}

fn selection_set_from_ast(selections: &[ast::Selection]) -> SelectionSet {
    selections.iter().map(Selection::from_ast).collect()
}

fn directives_from_ast(directives: &ast::DirectiveList) -> Vec<Directive> {
    directives
        .iter()
        .map(|directive| Directive {
            name: directive.name.to_string(),
            arguments: arguments_from_ast(&directive.arguments),
        })
        .collect()
}

fn arguments_from_ast(arguments: &[apollo_compiler::Node<ast::Argument>]) -> Vec<Argument> {
    arguments
        .iter()
        .map(|argument| Argument {
            name: argument.name.to_string(),
            value: InputValue::from_ast(&argument.value),
        })
        .collect()
}

impl Selection {
    fn from_ast(selection: &ast::Selection) -> Self {
        match selection {
            ast::Selection::Field(field) => Selection::Field(Field {
                alias: field.alias.as_ref().map(|alias| alias.to_string()),
                name: field.name.to_string(),
                arguments: arguments_from_ast(&field.arguments),
                directives: directives_from_ast(&field.directives),
                selection_set: (!field.selection_set.is_empty())
                    .then(|| selection_set_from_ast(&field.selection_set)),
            }),
            ast::Selection::InlineFragment(fragment) => Selection::InlineFragment(InlineFragment {
                type_condition: fragment
                    .type_condition
                    .as_ref()
                    .map(|type_condition| type_condition.to_string()),
                directives: directives_from_ast(&fragment.directives),
                selection_set: selection_set_from_ast(&fragment.selection_set),
            }),
            ast::Selection::FragmentSpread(spread) => Selection::FragmentSpread(FragmentSpread {
                fragment_name: spread.fragment_name.to_string(),
                directives: directives_from_ast(&spread.directives),
            }),
        }
    }
}

/// Prints a selection set on a single line: `{ a b { c } }`.
pub(crate) struct DisplaySelectionSet<'a>(pub(crate) &'a [Selection]);

impl fmt::Display for DisplaySelectionSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ {} }}", self.0.iter().join(" "))
    }
}

struct DisplayDirectives<'a>(&'a [Directive]);

impl fmt::Display for DisplayDirectives<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for directive in self.0 {
            write!(f, " {directive}")?;
        }
        Ok(())
    }
}

struct DisplayArguments<'a>(&'a [Argument]);

impl fmt::Display for DisplayArguments<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(
            f,
            "({})",
            self.0
                .iter()
                .map(|argument| format!("{}: {}", argument.name, argument.value))
                .join(", ")
        )
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Field(field) => field.fmt(f),
            Selection::InlineFragment(fragment) => {
                write!(f, "...")?;
                if let Some(type_condition) = &fragment.type_condition {
                    write!(f, " on {type_condition}")?;
                }
                write!(
                    f,
                    "{} {}",
                    DisplayDirectives(&fragment.directives),
                    DisplaySelectionSet(&fragment.selection_set)
                )
            }
            Selection::FragmentSpread(spread) => write!(
                f,
                "...{}{}",
                spread.fragment_name,
                DisplayDirectives(&spread.directives)
            ),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(alias) = &self.alias {
            write!(f, "{alias}: ")?;
        }
        write!(
            f,
            "{}{}{}",
            self.name,
            DisplayArguments(&self.arguments),
            DisplayDirectives(&self.directives)
        )?;
        if let Some(selection_set) = &self.selection_set {
            write!(f, " {}", DisplaySelectionSet(selection_set))?;
        }
        Ok(())
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}{}", self.name, DisplayArguments(&self.arguments))
    }
}

impl fmt::Display for VariableDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}: {}", self.name, self.ty)?;
        if let Some(default_value) = &self.default_value {
            write!(f, " = {default_value}")?;
        }
        Ok(())
    }
}

impl fmt::Display for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputValue::Null => f.write_str("null"),
            InputValue::Enum(value) | InputValue::Int(value) | InputValue::Float(value) => {
                f.write_str(value)
            }
            InputValue::Variable(name) => write!(f, "${name}"),
            InputValue::String(value) => {
                let escaped = serde_json::to_string(value).map_err(|_| fmt::Error)?;
                f.write_str(&escaped)
            }
            InputValue::Boolean(value) => write!(f, "{value}"),
            InputValue::List(items) => write!(f, "[{}]", items.iter().join(", ")),
            InputValue::Object(fields) => write!(
                f,
                "{{{}}}",
                fields
                    .iter()
                    .map(|(name, value)| format!("{name}: {value}"))
                    .join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_print() {
        let operation = Operation::from_document(
            r#"
            query Search($term: String!, $first: Int = 10, $withBody: Boolean!) {
                search(term: $term, first: $first, filter: { kind: [REVIEW], text: "a \"b\"" }) {
                    __typename
                    ... on Review @include(if: $withBody) { body }
                    ...UserParts
                }
            }
            fragment UserParts on User { id name: fullName }
            "#,
            None,
        )
        .unwrap();

        assert_eq!(operation.kind, OperationKind::Query);
        assert_eq!(operation.name.as_deref(), Some("Search"));
        assert_eq!(operation.fragments["UserParts"].type_condition, "User");
        assert_eq!(
            operation.variables[1],
            VariableDefinition {
                name: "first".to_string(),
                ty: "Int".to_string(),
                default_value: Some(InputValue::Int("10".to_string())),
            }
        );
        assert_eq!(
            DisplaySelectionSet(&operation.selection_set).to_string(),
            r#"{ search(term: $term, first: $first, filter: {kind: [REVIEW], text: "a \"b\""}) { __typename ... on Review @include(if: $withBody) { body } ...UserParts } }"#
        );
        assert_eq!(
            DisplaySelectionSet(&operation.fragments["UserParts"].selection_set).to_string(),
            "{ id name: fullName }"
        );
    }

    #[test]
    fn test_print_subrequest_only_declares_used_variables() {
        let operation = Operation::from_document(
            "query Q($id: ID!, $unused: String) { user(id: $id) { name } }",
            Some("Q"),
        )
        .unwrap();
        assert_eq!(
            operation.print_subrequest(OperationKind::Query, &operation.selection_set),
            "query($id: ID!) { user(id: $id) { name } }"
        );

        let Selection::Field(user) = &operation.selection_set[0] else {
            panic!("expected a field");
        };
        let nested = user.selection_set.as_ref().unwrap();
        assert_eq!(
            operation.print_subrequest(OperationKind::Query, nested),
            "query { name }"
        );
        assert!(variables_used(nested).is_empty());
    }

    #[test]
    fn test_operation_selection() {
        let document = "query A { a } mutation B { b }";
        assert_eq!(
            Operation::from_document(document, Some("B")).unwrap().kind,
            OperationKind::Mutation
        );
        assert_eq!(
            Operation::from_document(document, None),
            Err(SpecError::MultipleOperationWithoutOperationName)
        );
        assert_eq!(
            Operation::from_document(document, Some("C")),
            Err(SpecError::UnknownOperation("C".to_string()))
        );
        assert_eq!(
            Operation::from_document("fragment F on T { a }", None),
            Err(SpecError::NoOperation)
        );
        assert!(matches!(
            Operation::from_document("{ a ", None),
            Err(SpecError::ParsingError(_))
        ));
    }
}
