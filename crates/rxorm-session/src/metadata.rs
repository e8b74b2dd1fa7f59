//! Mapping metadata consumed by the persistence engine.
//!
//! These descriptors say how an entity's properties map to columns and how associations
//! behave under cascades. They are immutable once handed to a
//! [`PersisterRegistry`](crate::persister::PersisterRegistry).

use crate::cascade::CascadeStyle;

// ============================================================================
// Identifiers and generation
// ============================================================================

/// How an entity's identifier is produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IdGeneration {
    /// The application sets the identifier before persisting.
    #[default]
    Assigned,
    /// The database generates it on INSERT (identity / auto-increment column).
    Identity,
    /// Taken from the named database sequence when the entity is persisted.
    Sequence(String),
}

/// When the database produces a property's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationTiming {
    #[default]
    Never,
    /// Generated on INSERT only (defaults, triggers).
    Insert,
    /// Generated on INSERT and on every UPDATE.
    Always,
}

// ============================================================================
// Property types
// ============================================================================

/// Which side of a to-one association holds the foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyDirection {
    /// The owning entity's row references the associated row.
    FromParent,
    /// The associated row references the owning entity.
    ToParent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToOneKind {
    ManyToOne,
    OneToOne,
}

/// A to-one association to another entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityAssociation {
    /// Name of the associated entity.
    pub entity: String,
    pub kind: ToOneKind,
    pub fk_direction: ForeignKeyDirection,
    /// Shared primary key or unique foreign key; eligible for one-to-one orphan removal.
    pub logical_one_to_one: bool,
    /// For [`ForeignKeyDirection::ToParent`], the column in the associated table that
    /// references the owner.
    pub mapped_by_column: Option<String>,
}

impl EntityAssociation {
    /// A plain many-to-one; the foreign key lives in the owner's row.
    pub fn many_to_one(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            kind: ToOneKind::ManyToOne,
            fk_direction: ForeignKeyDirection::FromParent,
            logical_one_to_one: false,
            mapped_by_column: None,
        }
    }

    /// A one-to-one through a unique foreign key in the owner's row.
    pub fn one_to_one(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            kind: ToOneKind::OneToOne,
            fk_direction: ForeignKeyDirection::FromParent,
            logical_one_to_one: true,
            mapped_by_column: None,
        }
    }

    /// The inverse side of a one-to-one: the associated row holds `column` pointing back.
    pub fn one_to_one_mapped_by(entity: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            kind: ToOneKind::OneToOne,
            fk_direction: ForeignKeyDirection::ToParent,
            logical_one_to_one: true,
            mapped_by_column: Some(column.into()),
        }
    }
}

/// A polymorphic to-one: the row stores the target's entity name and identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyAssociation {
    pub type_column: String,
    pub id_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionAssociation {
    /// Role of the collection, `Owner.property`.
    pub role: String,
}

/// An embedded value type: its properties live in the owner's row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComponentType {
    pub properties: Vec<PropertyMeta>,
}

impl ComponentType {
    pub fn new(properties: Vec<PropertyMeta>) -> Self {
        Self { properties }
    }
}

/// The declared type of a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyType {
    Basic,
    Entity(EntityAssociation),
    Any(AnyAssociation),
    Collection(CollectionAssociation),
    Component(ComponentType),
}

impl PropertyType {
    pub fn is_association(&self) -> bool {
        matches!(
            self,
            PropertyType::Entity(_) | PropertyType::Any(_) | PropertyType::Collection(_)
        )
    }

    /// Foreign-key direction for association types.
    pub fn foreign_key_direction(&self) -> Option<ForeignKeyDirection> {
        match self {
            PropertyType::Entity(assoc) => Some(assoc.fk_direction),
            PropertyType::Any(_) => Some(ForeignKeyDirection::FromParent),
            PropertyType::Collection(_) => Some(ForeignKeyDirection::ToParent),
            PropertyType::Basic | PropertyType::Component(_) => None,
        }
    }
}

// ============================================================================
// Properties
// ============================================================================

/// One mapped property of an entity or component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMeta {
    pub name: String,
    pub ty: PropertyType,
    pub cascade: CascadeStyle,
    pub lazy: bool,
    pub nullable: bool,
    pub insertable: bool,
    pub updatable: bool,
    pub generated: GenerationTiming,
    /// Column holding the value (basic) or the foreign key (owning to-one).
    pub column: Option<String>,
}

impl PropertyMeta {
    fn with_type(name: String, ty: PropertyType, column: Option<String>) -> Self {
        Self {
            name,
            ty,
            cascade: CascadeStyle::NONE,
            lazy: false,
            nullable: true,
            insertable: true,
            updatable: true,
            generated: GenerationTiming::Never,
            column,
        }
    }

    /// A basic property stored in a column of the same name.
    pub fn basic(name: impl Into<String>) -> Self {
        let name = name.into();
        let column = Some(name.clone());
        Self::with_type(name, PropertyType::Basic, column)
    }

    /// A to-one association. Owning sides need a foreign-key column; set it with
    /// [`column`](Self::column).
    pub fn to_one(name: impl Into<String>, association: EntityAssociation) -> Self {
        Self::with_type(name.into(), PropertyType::Entity(association), None)
    }

    pub fn any(name: impl Into<String>, association: AnyAssociation) -> Self {
        Self::with_type(name.into(), PropertyType::Any(association), None)
    }

    pub fn collection(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self::with_type(
            name.into(),
            PropertyType::Collection(CollectionAssociation { role: role.into() }),
            None,
        )
    }

    pub fn component(name: impl Into<String>, component: ComponentType) -> Self {
        Self::with_type(name.into(), PropertyType::Component(component), None)
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    #[must_use]
    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    #[must_use]
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    #[must_use]
    pub fn insertable(mut self, insertable: bool) -> Self {
        self.insertable = insertable;
        self
    }

    #[must_use]
    pub fn updatable(mut self, updatable: bool) -> Self {
        self.updatable = updatable;
        self
    }

    #[must_use]
    pub fn generated(mut self, timing: GenerationTiming) -> Self {
        self.generated = timing;
        self
    }

    /// Whether the owner's row has one or more columns for this property.
    pub fn has_columns(&self) -> bool {
        match &self.ty {
            PropertyType::Basic => self.column.is_some(),
            PropertyType::Entity(assoc) => {
                assoc.fk_direction == ForeignKeyDirection::FromParent && self.column.is_some()
            }
            PropertyType::Any(_) => true,
            PropertyType::Collection(_) => false,
            PropertyType::Component(component) => {
                component.properties.iter().any(PropertyMeta::has_columns)
            }
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A secondary table sharing the entity's identifier (joined-subclass style).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedTable {
    pub table: String,
    /// Column holding the entity identifier in this table.
    pub key_column: String,
    /// Indexes into [`EntityMetadata::properties`] stored in this table.
    pub properties: Vec<usize>,
}

/// Everything the engine knows about one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    pub id_column: String,
    pub id_generation: IdGeneration,
    pub version_column: Option<String>,
    pub properties: Vec<PropertyMeta>,
    pub joined_tables: Vec<JoinedTable>,
    /// Indexes of the properties forming the natural id, if any.
    pub natural_id: Vec<usize>,
    /// Whether instances go through the second-level cache.
    pub cacheable: bool,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id_column: "id".to_string(),
            id_generation: IdGeneration::Assigned,
            version_column: None,
            properties: Vec::new(),
            joined_tables: Vec::new(),
            natural_id: Vec::new(),
            cacheable: false,
        }
    }

    #[must_use]
    pub fn id(mut self, column: impl Into<String>, generation: IdGeneration) -> Self {
        self.id_column = column.into();
        self.id_generation = generation;
        self
    }

    #[must_use]
    pub fn version(mut self, column: impl Into<String>) -> Self {
        self.version_column = Some(column.into());
        self
    }

    #[must_use]
    pub fn property(mut self, property: PropertyMeta) -> Self {
        self.properties.push(property);
        self
    }

    /// Store the named properties in a joined table keyed by `key_column`.
    ///
    /// Unknown names are ignored here and reported by registry validation.
    #[must_use]
    pub fn joined_table(
        mut self,
        table: impl Into<String>,
        key_column: impl Into<String>,
        properties: &[&str],
    ) -> Self {
        let indexes = properties
            .iter()
            .filter_map(|name| self.property_index(name))
            .collect();
        self.joined_tables.push(JoinedTable {
            table: table.into(),
            key_column: key_column.into(),
            properties: indexes,
        });
        self
    }

    #[must_use]
    pub fn natural_id(mut self, properties: &[&str]) -> Self {
        self.natural_id = properties
            .iter()
            .filter_map(|name| self.property_index(name))
            .collect();
        self
    }

    #[must_use]
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn is_versioned(&self) -> bool {
        self.version_column.is_some()
    }

    /// Whether any property cascades some action or removes orphans.
    pub fn has_cascades(&self) -> bool {
        fn cascades(properties: &[PropertyMeta]) -> bool {
            properties.iter().any(|p| {
                p.cascade.is_cascading()
                    || matches!(&p.ty, PropertyType::Component(c) if cascades(&c.properties))
            })
        }
        cascades(&self.properties)
    }

    /// Whether the database generates values that must be read back after `timing`.
    pub fn has_generated(&self, timing: GenerationTiming) -> bool {
        self.properties.iter().any(|p| match (p.generated, timing) {
            (GenerationTiming::Never, _) => false,
            (GenerationTiming::Always, _) => true,
            (GenerationTiming::Insert, t) => t == GenerationTiming::Insert,
        })
    }

    /// The table a property's columns live in.
    pub fn table_of(&self, index: usize) -> &str {
        self.joined_tables
            .iter()
            .find(|t| t.properties.contains(&index))
            .map_or(self.table.as_str(), |t| t.table.as_str())
    }
}

// ============================================================================
// Collections
// ============================================================================

/// What a collection holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Basic,
    Entity(String),
    Component(ComponentType),
}

/// Where a collection's membership is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionStorage {
    /// Maintained by the element side's many-to-one; the collection writes nothing.
    Inverse {
        table: String,
        key_column: String,
        element_id_column: String,
    },
    /// A foreign key in the element table, written by the collection.
    ForeignKey {
        table: String,
        key_column: String,
        element_id_column: String,
    },
    /// A link table of owner keys and element columns.
    JoinTable {
        table: String,
        key_column: String,
        element_columns: Vec<String>,
    },
}

impl CollectionStorage {
    pub fn table(&self) -> &str {
        match self {
            CollectionStorage::Inverse { table, .. }
            | CollectionStorage::ForeignKey { table, .. }
            | CollectionStorage::JoinTable { table, .. } => table,
        }
    }

    pub fn key_column(&self) -> &str {
        match self {
            CollectionStorage::Inverse { key_column, .. }
            | CollectionStorage::ForeignKey { key_column, .. }
            | CollectionStorage::JoinTable { key_column, .. } => key_column,
        }
    }

    pub fn is_inverse(&self) -> bool {
        matches!(self, CollectionStorage::Inverse { .. })
    }
}

/// Metadata for one collection role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMetadata {
    pub role: String,
    /// Owning entity name.
    pub owner: String,
    pub element: ElementKind,
    pub storage: CollectionStorage,
    /// Membership changes on an uninitialized collection are queued, not loaded.
    pub extra_lazy: bool,
    /// The database deletes the rows when the owner is deleted.
    pub on_delete_cascade: bool,
}

impl CollectionMetadata {
    pub fn new(
        role: impl Into<String>,
        owner: impl Into<String>,
        element: ElementKind,
        storage: CollectionStorage,
    ) -> Self {
        Self {
            role: role.into(),
            owner: owner.into(),
            element,
            storage,
            extra_lazy: false,
            on_delete_cascade: false,
        }
    }

    /// A bidirectional one-to-many kept by the element's many-to-one.
    pub fn inverse_one_to_many(
        role: impl Into<String>,
        owner: impl Into<String>,
        element: impl Into<String>,
        table: impl Into<String>,
        key_column: impl Into<String>,
    ) -> Self {
        Self::new(
            role,
            owner,
            ElementKind::Entity(element.into()),
            CollectionStorage::Inverse {
                table: table.into(),
                key_column: key_column.into(),
                element_id_column: "id".to_string(),
            },
        )
    }

    /// A unidirectional one-to-many whose foreign key the collection writes.
    pub fn one_to_many(
        role: impl Into<String>,
        owner: impl Into<String>,
        element: impl Into<String>,
        table: impl Into<String>,
        key_column: impl Into<String>,
    ) -> Self {
        Self::new(
            role,
            owner,
            ElementKind::Entity(element.into()),
            CollectionStorage::ForeignKey {
                table: table.into(),
                key_column: key_column.into(),
                element_id_column: "id".to_string(),
            },
        )
    }

    #[must_use]
    pub fn extra_lazy(mut self, extra_lazy: bool) -> Self {
        self.extra_lazy = extra_lazy;
        self
    }

    #[must_use]
    pub fn on_delete_cascade(mut self, enabled: bool) -> Self {
        self.on_delete_cascade = enabled;
        self
    }

    /// Override the element identifier column of entity storages.
    #[must_use]
    pub fn element_id_column(mut self, column: impl Into<String>) -> Self {
        match &mut self.storage {
            CollectionStorage::Inverse {
                element_id_column, ..
            }
            | CollectionStorage::ForeignKey {
                element_id_column, ..
            } => *element_id_column = column.into(),
            CollectionStorage::JoinTable { .. } => {}
        }
        self
    }

    pub fn element_entity(&self) -> Option<&str> {
        match &self.element {
            ElementKind::Entity(name) => Some(name),
            _ => None,
        }
    }
}
