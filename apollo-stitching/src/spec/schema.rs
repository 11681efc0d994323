//! The unified schema: merged types plus the per-field ownership index.

use apollo_compiler::schema::ExtendedType;
use displaydoc::Display;
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

use crate::spec::OperationKind;
use crate::spec::TYPENAME;

/// The name a subgraph is registered under.
pub type SubgraphName = String;

/// What the stitching engine needs to know about the unified type system.
///
/// Ownership lists are ordered and that order must be stable, planning depends on it.
pub trait UnifiedSchema: Send + Sync {
    /// The subgraphs able to resolve `field_name` on `type_name`.
    fn owners_of(&self, type_name: &str, field_name: &str) -> &[SubgraphName];

    fn type_by_name(&self, name: &str) -> Option<&TypeDefinition>;

    /// The name of the root type for operations of this kind, if the schema defines one.
    fn root_type(&self, kind: OperationKind) -> Option<&str>;

    /// The object types an abstract type can resolve to.
    ///
    /// Empty for object types and for unknown names.
    fn possible_types(&self, abstract_type: &str) -> &[String];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TypeKind {
    Scalar,
    Enum,
    Object,
    Interface,
    Union,
    InputObject,
}

impl TypeKind {
    /// Whether values of this type have a selection set.
    pub fn is_composite(&self) -> bool {
        matches!(self, TypeKind::Object | TypeKind::Interface | TypeKind::Union)
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self, TypeKind::Interface | TypeKind::Union)
    }

    fn of(ty: &ExtendedType) -> Self {
        match ty {
            ExtendedType::Scalar(_) => TypeKind::Scalar,
            ExtendedType::Object(_) => TypeKind::Object,
            ExtendedType::Interface(_) => TypeKind::Interface,
            ExtendedType::Union(_) => TypeKind::Union,
            ExtendedType::Enum(_) => TypeKind::Enum,
            ExtendedType::InputObject(_) => TypeKind::InputObject,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TypeDefinition {
    pub name: String,
    pub kind: TypeKind,
    pub fields: IndexMap<String, FieldDefinition>,
    /// Object types this type resolves to, when abstract.
    pub possible_types: Vec<String>,
    /// Interfaces implemented by an object or interface type.
    pub interfaces: Vec<String>,
    /// Subgraphs defining this type.
    pub owners: Vec<SubgraphName>,
    #[serde(skip)]
    union_members: Vec<String>,
}

impl TypeDefinition {
    fn new(name: String, kind: TypeKind) -> Self {
        Self {
            name,
            kind,
            fields: IndexMap::new(),
            possible_types: Vec::new(),
            interfaces: Vec::new(),
            owners: Vec::new(),
            union_members: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldDefinition {
    pub name: String,
    /// The field type as written, e.g. `[Review!]!`.
    pub ty: String,
    /// The named type once list and non-null wrappers are removed.
    pub type_name: String,
    pub owners: Vec<SubgraphName>,
}

/// Schema merging errors.
#[derive(Error, Debug, Display, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchemaError {
    /// invalid schema for subgraph '{subgraph}': {reason}
    Parse { subgraph: String, reason: String },

    /// type '{type_name}' is a {existing:?} in one subgraph and a {found:?} in subgraph '{subgraph}'
    KindMismatch {
        type_name: String,
        existing: TypeKind,
        found: TypeKind,
        subgraph: String,
    },

    /// subgraph '{subgraph}' names its {kind} root type '{found}' but '{expected}' was already registered
    RootTypeMismatch {
        subgraph: String,
        kind: OperationKind,
        expected: String,
        found: String,
    },

    /// subgraph '{0}' is registered twice
    DuplicateSubgraph(String),
}

/// A naive merge of subgraph type systems.
///
/// Types are unioned by name; each field remembers which subgraphs define it, in registration
/// order. No directive is interpreted.
#[derive(Clone, Debug, Default)]
pub struct Supergraph {
    types: IndexMap<String, TypeDefinition>,
    roots: IndexMap<OperationKind, String>,
    subgraphs: Vec<SubgraphName>,
}

/// Collects subgraph SDLs for [`Supergraph`].
#[derive(Clone, Debug, Default)]
pub struct SupergraphBuilder {
    subgraphs: Vec<(SubgraphName, String)>,
}

impl SupergraphBuilder {
    pub fn subgraph(mut self, name: impl Into<String>, sdl: impl Into<String>) -> Self {
        self.subgraphs.push((name.into(), sdl.into()));
        self
    }

    pub fn build(self) -> Result<Supergraph, SchemaError> {
        let mut supergraph = Supergraph::default();
        for (name, sdl) in self.subgraphs {
            supergraph.merge(name, &sdl)?;
        }
        supergraph.compute_possible_types();
        Ok(supergraph)
    }
}

impl Supergraph {
    pub fn builder() -> SupergraphBuilder {
        SupergraphBuilder::default()
    }

    /// Registered subgraph names, in registration order.
    pub fn subgraphs(&self) -> &[SubgraphName] {
        &self.subgraphs
    }

    fn merge(&mut self, subgraph: SubgraphName, sdl: &str) -> Result<(), SchemaError> {
        if self.subgraphs.contains(&subgraph) {
            return Err(SchemaError::DuplicateSubgraph(subgraph));
        }
        let schema = apollo_compiler::Schema::parse(sdl, format!("{subgraph}.graphql"))
            .map_err(|err| SchemaError::Parse {
                subgraph: subgraph.clone(),
                reason: err.errors.to_string(),
            })?;

        for kind in [
            OperationKind::Query,
            OperationKind::Mutation,
            OperationKind::Subscription,
        ] {
            let Some(found) = schema.root_operation(kind.into()) else {
                continue;
            };
            match self.roots.get(&kind) {
                Some(expected) if expected.as_str() != found.as_str() => {
                    return Err(SchemaError::RootTypeMismatch {
                        subgraph,
                        kind,
                        expected: expected.clone(),
                        found: found.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    self.roots.insert(kind, found.to_string());
                }
            }
        }

        for (type_name, ty) in schema.types.iter() {
            if ty.is_built_in() {
                continue;
            }
            let kind = TypeKind::of(ty);
            let definition = self
                .types
                .entry(type_name.to_string())
                .or_insert_with(|| TypeDefinition::new(type_name.to_string(), kind));
            if definition.kind != kind {
                return Err(SchemaError::KindMismatch {
                    type_name: type_name.to_string(),
                    existing: definition.kind,
                    found: kind,
                    subgraph,
                });
            }
            push_unique(&mut definition.owners, &subgraph);

            match ty {
                ExtendedType::Object(object) => {
                    for interface in object.implements_interfaces.iter() {
                        push_unique(&mut definition.interfaces, interface.name.as_str());
                    }
                    for (field_name, field) in object.fields.iter() {
                        add_field(definition, field_name, &field.ty, &subgraph);
                    }
                }
                ExtendedType::Interface(interface) => {
                    for parent in interface.implements_interfaces.iter() {
                        push_unique(&mut definition.interfaces, parent.name.as_str());
                    }
                    for (field_name, field) in interface.fields.iter() {
                        add_field(definition, field_name, &field.ty, &subgraph);
                    }
                }
                ExtendedType::Union(union_) => {
                    for member in union_.members.iter() {
                        push_unique(&mut definition.union_members, member.name.as_str());
                    }
                }
                ExtendedType::Scalar(_) | ExtendedType::Enum(_) | ExtendedType::InputObject(_) => {}
            }
        }

        self.subgraphs.push(subgraph);
        Ok(())
    }

    fn compute_possible_types(&mut self) {
        let objects: Vec<(String, Vec<String>)> = self
            .types
            .values()
            .filter(|ty| ty.kind == TypeKind::Object)
            .map(|ty| (ty.name.clone(), ty.interfaces.clone()))
            .collect();
        let object_names: Vec<&str> = objects.iter().map(|(name, _)| name.as_str()).collect();

        let mut possible_types: Vec<(String, Vec<String>)> = Vec::new();
        for ty in self.types.values() {
            let possible = match ty.kind {
                TypeKind::Interface => objects
                    .iter()
                    .filter(|(_, interfaces)| interfaces.contains(&ty.name))
                    .map(|(name, _)| name.clone())
                    .collect(),
                TypeKind::Union => ty
                    .union_members
                    .iter()
                    .filter(|member| object_names.contains(&member.as_str()))
                    .cloned()
                    .collect(),
                _ => continue,
            };
            possible_types.push((ty.name.clone(), possible));
        }
        for (name, possible) in possible_types {
            if let Some(ty) = self.types.get_mut(&name) {
                ty.possible_types = possible;
            }
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

fn add_field(
    definition: &mut TypeDefinition,
    field_name: &str,
    ty: &apollo_compiler::ast::Type,
    subgraph: &str,
) {
    let field = definition
        .fields
        .entry(field_name.to_string())
        .or_insert_with(|| FieldDefinition {
            name: field_name.to_string(),
            ty: ty.to_string(),
            type_name: ty.inner_named_type().to_string(),
            owners: Vec::new(),
        });
    push_unique(&mut field.owners, subgraph);
}

impl UnifiedSchema for Supergraph {
    fn owners_of(&self, type_name: &str, field_name: &str) -> &[SubgraphName] {
        let Some(ty) = self.types.get(type_name) else {
            return &[];
        };
        if field_name == TYPENAME {
            return &ty.owners;
        }
        ty.fields
            .get(field_name)
            .map(|field| field.owners.as_slice())
            .unwrap_or(&[])
    }

    fn type_by_name(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    fn root_type(&self, kind: OperationKind) -> Option<&str> {
        self.roots.get(&kind).map(String::as_str)
    }

    fn possible_types(&self, abstract_type: &str) -> &[String] {
        self.types
            .get(abstract_type)
            .map(|ty| ty.possible_types.as_slice())
            .unwrap_or(&[])
    }
}
