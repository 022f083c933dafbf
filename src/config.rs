//! Fluent builders turning user-defined dependency patterns into the graph
//! representation the scheduler queries.
//!
//! An action's configuration is an `Action` entity with a `Category` child
//! and one `Dependency` child per named pattern; each dependency owns a
//! single tree of `Structure` nodes. [`ActionConfig::build`] produces that
//! sub-graph as transport data ready for the mapper.

use std::collections::BTreeMap;
use std::fmt;

use crate::transport::{Entity, Relation, CONTEXT_SYSTEM, ID_CREATE};

/// Structural role of a dependency node. `Primary` marks the conceptual
/// driver and is preferred as the witness anchor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    Primary,
    #[default]
    Secondary,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Primary => "Primary",
            Priority::Secondary => "Secondary",
        }
    }

    /// Parse the persisted form; anything unrecognised is `Secondary`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "Primary" => Priority::Primary,
            _ => Priority::Secondary,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Matching mode of a dependency node. `Set` is satisfied by any entity of
/// the declared kind; `Match` additionally requires every filter to hold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Set,
    Match,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Set => "Set",
            Mode::Match => "Match",
        }
    }

    /// Parse the persisted form; anything unrecognised is `Set`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "Match" => Mode::Match,
            _ => Mode::Set,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a dependency pattern under construction.
#[derive(Clone, Debug)]
pub struct Structure {
    kind: String,
    priority: Priority,
    mode: Mode,
    alias: String,
    /// name -> (field, operator, value); BTreeMap keeps the persisted
    /// filter index deterministic.
    filters: BTreeMap<String, (String, String, String)>,
    children: Vec<Structure>,
    parents: Vec<Structure>,
}

impl Structure {
    /// A `Set`/`Secondary` node requiring an entity of `kind`.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            priority: Priority::Secondary,
            mode: Mode::Set,
            alias: String::new(),
            filters: BTreeMap::new(),
            children: Vec::new(),
            parents: Vec::new(),
        }
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Stable alias distinguishing same-kind siblings at one level.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Add a named filter triple, e.g. `("proto", "Value", "==", "protoX")`.
    #[must_use]
    pub fn filter(
        mut self,
        name: impl Into<String>,
        field: impl Into<String>,
        operator: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.filters
            .insert(name.into(), (field.into(), operator.into(), value.into()));
        self
    }

    #[must_use]
    pub fn child(mut self, child: Structure) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub fn parent(mut self, parent: Structure) -> Self {
        self.parents.push(parent);
        self
    }

    /// Lower this node (and everything hanging off it) into `Structure`
    /// transport entities.
    #[must_use]
    pub fn transform(&self) -> Entity {
        let mut node = Entity {
            kind: "Structure".to_string(),
            id: ID_CREATE,
            value: self.kind.clone(),
            context: CONTEXT_SYSTEM.to_string(),
            ..Default::default()
        };
        if !self.alias.is_empty() {
            node.properties.insert("Alias".to_string(), self.alias.clone());
        }
        let mut all_filters = Vec::new();
        for (name, (field, operator, value)) in &self.filters {
            node.properties
                .insert(format!("Filter.{name}.Field"), field.clone());
            node.properties
                .insert(format!("Filter.{name}.Operator"), operator.clone());
            node.properties
                .insert(format!("Filter.{name}.Value"), value.clone());
            all_filters.push(field.clone());
        }
        // filter-field index for cheap retrieval
        if !all_filters.is_empty() {
            node.properties
                .insert("AllFilters".to_string(), all_filters.join(","));
        }
        node.properties
            .insert("Mode".to_string(), self.mode.as_str().to_string());
        node.properties
            .insert("Type".to_string(), self.priority.as_str().to_string());
        for parent in &self.parents {
            node.parents.push(Relation {
                context: CONTEXT_SYSTEM.to_string(),
                target: parent.transform(),
                ..Default::default()
            });
        }
        for child in &self.children {
            node.children.push(Relation {
                context: CONTEXT_SYSTEM.to_string(),
                target: child.transform(),
                ..Default::default()
            });
        }
        node
    }
}

/// Builder for a complete action configuration.
#[derive(Clone, Debug, Default)]
pub struct ActionConfig {
    name: String,
    category: String,
    dependencies: Vec<(String, Structure)>,
}

impl ActionConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Register a named dependency pattern.
    #[must_use]
    pub fn dependency(mut self, name: impl Into<String>, structure: Structure) -> Self {
        self.dependencies.push((name.into(), structure));
        self
    }

    /// Produce the `Action` sub-graph for the mapper.
    #[must_use]
    pub fn build(&self) -> Entity {
        let mut action = Entity {
            kind: "Action".to_string(),
            id: ID_CREATE,
            value: self.name.clone(),
            context: CONTEXT_SYSTEM.to_string(),
            ..Default::default()
        };
        action.children.push(Relation {
            context: CONTEXT_SYSTEM.to_string(),
            target: Entity {
                kind: "Category".to_string(),
                value: self.category.clone(),
                context: CONTEXT_SYSTEM.to_string(),
                ..Default::default()
            },
            ..Default::default()
        });
        for (name, structure) in &self.dependencies {
            let mut dependency = Entity {
                kind: "Dependency".to_string(),
                id: ID_CREATE,
                value: name.clone(),
                context: CONTEXT_SYSTEM.to_string(),
                ..Default::default()
            };
            dependency.children.push(Relation {
                context: CONTEXT_SYSTEM.to_string(),
                target: structure.transform(),
                ..Default::default()
            });
            action.children.push(Relation {
                context: CONTEXT_SYSTEM.to_string(),
                target: dependency,
                ..Default::default()
            });
        }
        action
    }
}
