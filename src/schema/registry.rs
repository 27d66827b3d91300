//! # Schema Registry
//!
//! The in-memory canonical form of every type definition. The registry
//! owns name uniqueness, forward stubs, alias resolution, the composite
//! inheritance tree, the interface DAG, effective-field computation, the
//! polymorphic implementers cache, and the stable uint16 type-ids that
//! interface-typed slots persist.
//!
//! ## Implementers Cache
//!
//! `implementers_of` answers "which composites implement interface I"
//! without touching stored data. The cache is built lazily: a BFS over the
//! interface → child-interface graph collects every descendant of I, and a
//! composite implements I when any of its composite ancestors declares one
//! of those descendants. Any registration invalidates the cache.

use eyre::{bail, ensure, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::debug;

use super::def::{
    array_name, dict_entry_name, dictionary_name, set_name, FieldDef, TypeDef, TypeKind,
    ALL_PRIMITIVES, BIGINT, BIGUINT, FRACTION, STRING,
};

#[derive(Debug)]
pub struct SchemaRegistry {
    types: HashMap<String, TypeDef>,
    type_ids: HashMap<String, u16>,
    ids_to_names: HashMap<u16, String>,
    next_type_id: u16,
    implementers: Mutex<Option<HashMap<String, Vec<String>>>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    /// Creates a registry pre-populated with the builtin kinds.
    pub fn new() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
            type_ids: HashMap::new(),
            ids_to_names: HashMap::new(),
            next_type_id: 1,
            implementers: Mutex::new(None),
        };

        for p in ALL_PRIMITIVES {
            registry.types.insert(
                p.name().to_string(),
                TypeDef {
                    name: p.name().to_string(),
                    kind: TypeKind::Primitive(p),
                },
            );
        }
        registry.types.insert(
            STRING.to_string(),
            TypeDef {
                name: STRING.to_string(),
                kind: TypeKind::StringType,
            },
        );
        registry.types.insert(
            BIGINT.to_string(),
            TypeDef {
                name: BIGINT.to_string(),
                kind: TypeKind::BigInt,
            },
        );
        registry.types.insert(
            BIGUINT.to_string(),
            TypeDef {
                name: BIGUINT.to_string(),
                kind: TypeKind::BigUInt,
            },
        );
        registry.types.insert(
            FRACTION.to_string(),
            TypeDef {
                name: FRACTION.to_string(),
                kind: TypeKind::Fraction,
            },
        );

        registry
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn get(&self, name: &str) -> Result<&TypeDef> {
        self.types
            .get(name)
            .ok_or_else(|| eyre::eyre!("unknown type '{}'", name))
    }

    /// Resolves through alias chains to a non-alias definition.
    pub fn resolve(&self, name: &str) -> Result<&TypeDef> {
        let mut current = self.get(name)?;
        let mut hops = 0;
        while let TypeKind::Alias { target } = &current.kind {
            current = self.get(target)?;
            hops += 1;
            ensure!(hops <= self.types.len(), "alias cycle through '{}'", name);
        }
        Ok(current)
    }

    /// Every registered name in sorted order. Deterministic iteration for
    /// persistence and compaction.
    pub fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn type_id(&self, composite: &str) -> Result<u16> {
        self.type_ids
            .get(composite)
            .copied()
            .ok_or_else(|| eyre::eyre!("no type-id assigned to '{}'", composite))
    }

    pub fn type_name_by_id(&self, id: u16) -> Option<&str> {
        self.ids_to_names.get(&id).map(|s| s.as_str())
    }

    pub fn type_ids(&self) -> &HashMap<String, u16> {
        &self.type_ids
    }

    /// Registers a forward stub. Idempotent for existing stubs; a name
    /// already bound to a real definition is a conflict.
    pub fn register_stub(&mut self, name: &str) -> Result<()> {
        match self.types.get(name) {
            None => {
                self.types.insert(
                    name.to_string(),
                    TypeDef {
                        name: name.to_string(),
                        kind: TypeKind::Stub,
                    },
                );
                Ok(())
            }
            Some(def) if def.is_stub() => Ok(()),
            Some(_) => bail!("type '{}' is already defined", name),
        }
    }

    /// Names of stubs that were never populated. Must be empty before the
    /// schema document is committed.
    pub fn unpopulated_stubs(&self) -> Vec<String> {
        let mut stubs: Vec<String> = self
            .types
            .values()
            .filter(|d| d.is_stub())
            .map(|d| d.name.clone())
            .collect();
        stubs.sort();
        stubs
    }

    /// Registers a definition, replacing a forward stub of the same name.
    pub fn register(&mut self, def: TypeDef) -> Result<()> {
        ensure!(!def.name.is_empty(), "type name must not be empty");
        ensure!(!def.is_stub(), "use register_stub for forward declarations");

        if let Some(existing) = self.types.get(&def.name) {
            ensure!(
                existing.is_stub(),
                "type '{}' is already defined",
                def.name
            );
        }

        self.validate(&def)?;

        if def.is_composite() && !self.type_ids.contains_key(&def.name) {
            let id = self.next_type_id;
            ensure!(id < u16::MAX, "type-id space exhausted");
            self.next_type_id += 1;
            self.type_ids.insert(def.name.clone(), id);
            self.ids_to_names.insert(id, def.name.clone());
        }

        debug!(name = %def.name, "registered type");
        self.types.insert(def.name.clone(), def);
        *self.implementers.lock() = None;
        Ok(())
    }

    fn field_type_known(&self, def_name: &str, type_name: &str) -> bool {
        type_name == def_name || self.types.contains_key(type_name)
    }

    fn validate(&self, def: &TypeDef) -> Result<()> {
        match &def.kind {
            TypeKind::Primitive(_)
            | TypeKind::StringType
            | TypeKind::BigInt
            | TypeKind::BigUInt
            | TypeKind::Fraction => Ok(()),
            TypeKind::Stub => Ok(()),
            TypeKind::Alias { target } => {
                ensure!(
                    self.types.contains_key(target),
                    "alias '{}' targets unknown type '{}'",
                    def.name,
                    target
                );
                Ok(())
            }
            TypeKind::Array { element } | TypeKind::Set { element } => {
                ensure!(
                    self.types.contains_key(element),
                    "element type '{}' of '{}' is unknown",
                    element,
                    def.name
                );
                // Stub elements defer the width check to first use.
                let resolved = self.resolve(element)?;
                if !resolved.is_stub() {
                    resolved.element_width()?;
                }
                Ok(())
            }
            TypeKind::Dictionary { key, value, entry } => {
                ensure!(
                    self.types.contains_key(key),
                    "dictionary key type '{}' is unknown",
                    key
                );
                ensure!(
                    self.types.contains_key(value),
                    "dictionary value type '{}' is unknown",
                    value
                );
                ensure!(
                    self.types
                        .get(entry)
                        .is_some_and(|e| e.is_composite()),
                    "dictionary entry composite '{}' is not registered",
                    entry
                );
                Ok(())
            }
            TypeKind::Composite {
                fields,
                parent,
                interfaces,
            } => {
                if let Some(parent) = parent {
                    let parent_def = self
                        .types
                        .get(parent)
                        .ok_or_else(|| eyre::eyre!("parent composite '{}' is unknown", parent))?;
                    ensure!(
                        parent_def.is_composite(),
                        "parent '{}' of '{}' is not a composite",
                        parent,
                        def.name
                    );
                    self.check_composite_chain(&def.name, parent)?;
                }

                for iface in interfaces {
                    let iface_def = self
                        .types
                        .get(iface)
                        .ok_or_else(|| eyre::eyre!("interface '{}' is unknown", iface))?;
                    ensure!(
                        iface_def.is_interface(),
                        "'{}' declared by '{}' is not an interface",
                        iface,
                        def.name
                    );
                }

                self.validate_fields(def, fields)?;

                // Inherited-field merges must be coherent. Zero effective
                // fields is legal here (pure polymorphic markers); the
                // record layout rejects such composites at first insert,
                // since a 0-byte record would break the tombstone
                // sentinel.
                self.effective_fields_of(def)?;
                Ok(())
            }
            TypeKind::Interface { fields, parents } => {
                for parent in parents {
                    let parent_def = self
                        .types
                        .get(parent)
                        .ok_or_else(|| eyre::eyre!("parent interface '{}' is unknown", parent))?;
                    ensure!(
                        parent_def.is_interface(),
                        "parent '{}' of interface '{}' is not an interface",
                        parent,
                        def.name
                    );
                }
                self.check_interface_dag(&def.name, parents)?;
                self.validate_fields(def, fields)?;
                // Diamond merges must be coherent before registration.
                self.effective_fields_of(def)?;
                Ok(())
            }
            TypeKind::Enum { variants, backing, .. } => {
                let mut seen = HashSet::new();
                for v in variants {
                    ensure!(
                        seen.insert(v.name.as_str()),
                        "duplicate variant '{}' in enum '{}'",
                        v.name,
                        def.name
                    );
                    self.validate_fields(def, &v.fields)?;
                }
                if let Some(backing) = backing {
                    ensure!(
                        backing.is_integer(),
                        "enum '{}' backing type '{}' is not an integer",
                        def.name,
                        backing.name()
                    );
                    let max = variants.iter().map(|v| v.discriminant).max().unwrap_or(0);
                    let fits = match backing.width() {
                        1 => max <= u8::MAX as u32,
                        2 => max <= u16::MAX as u32,
                        _ => true,
                    };
                    ensure!(
                        fits,
                        "enum '{}' discriminant {} does not fit backing '{}'",
                        def.name,
                        max,
                        backing.name()
                    );
                }
                Ok(())
            }
        }
    }

    fn validate_fields(&self, def: &TypeDef, fields: &[FieldDef]) -> Result<()> {
        let mut seen = HashSet::new();
        for field in fields {
            ensure!(
                seen.insert(field.name.as_str()),
                "duplicate field '{}' in '{}'",
                field.name,
                def.name
            );
            ensure!(
                self.field_type_known(&def.name, &field.type_name),
                "field '{}.{}' references unknown type '{}'",
                def.name,
                field.name,
                field.type_name
            );

            if field.overflow.is_some() {
                // Self-references cannot be integers, so resolve is safe.
                let resolved = self.resolve(&field.type_name)?;
                let is_integer = matches!(
                    resolved.kind,
                    TypeKind::Primitive(p) if p.is_integer()
                );
                ensure!(
                    is_integer,
                    "overflow policy on '{}.{}' requires an integer type, found '{}'",
                    def.name,
                    field.name,
                    field.type_name
                );
            }
        }
        Ok(())
    }

    fn check_composite_chain(&self, start: &str, parent: &str) -> Result<()> {
        let mut seen = HashSet::new();
        seen.insert(start.to_string());
        let mut current = Some(parent.to_string());
        while let Some(name) = current {
            ensure!(
                seen.insert(name.clone()),
                "cycle in composite extends chain at '{}'",
                name
            );
            current = match self.types.get(&name).map(|d| &d.kind) {
                Some(TypeKind::Composite { parent, .. }) => parent.clone(),
                _ => None,
            };
        }
        Ok(())
    }

    fn check_interface_dag(&self, start: &str, parents: &[String]) -> Result<()> {
        // DFS from each declared parent; reaching `start` again is a cycle.
        let mut stack: Vec<String> = parents.to_vec();
        let mut seen = HashSet::new();
        while let Some(name) = stack.pop() {
            ensure!(
                name != start,
                "cycle in interface extends chain at '{}'",
                start
            );
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(TypeKind::Interface { parents, .. }) =
                self.types.get(&name).map(|d| &d.kind)
            {
                stack.extend(parents.iter().cloned());
            }
        }
        Ok(())
    }

    /// Composite ancestors (nearest first) for composites, transitive
    /// parent interfaces for interfaces.
    pub fn ancestors_of(&self, name: &str) -> Result<Vec<String>> {
        let def = self.get(name)?;
        match &def.kind {
            TypeKind::Composite { .. } => {
                let mut out = Vec::new();
                let mut current = self.composite_parent(name)?;
                while let Some(parent) = current {
                    out.push(parent.clone());
                    current = self.composite_parent(&parent)?;
                }
                Ok(out)
            }
            TypeKind::Interface { parents, .. } => {
                let mut out = Vec::new();
                let mut seen = HashSet::new();
                let mut queue: Vec<String> = parents.clone();
                while let Some(p) = queue.pop() {
                    if !seen.insert(p.clone()) {
                        continue;
                    }
                    if let Some(TypeKind::Interface { parents, .. }) =
                        self.types.get(&p).map(|d| &d.kind)
                    {
                        queue.extend(parents.iter().cloned());
                    }
                    out.push(p);
                }
                out.sort();
                Ok(out)
            }
            _ => bail!("'{}' has no ancestors; not a composite or interface", name),
        }
    }

    fn composite_parent(&self, name: &str) -> Result<Option<String>> {
        match &self.get(name)?.kind {
            TypeKind::Composite { parent, .. } => Ok(parent.clone()),
            _ => Ok(None),
        }
    }

    /// Effective field list: composite-parent fields first (root-most
    /// ancestor leading), then interface-contributed fields, then declared
    /// fields. Identical fields arriving via a diamond merge silently;
    /// same-name different-type collisions are errors.
    pub fn effective_fields(&self, name: &str) -> Result<Vec<FieldDef>> {
        self.effective_fields_of(self.get(name)?)
    }

    fn effective_fields_of(&self, def: &TypeDef) -> Result<Vec<FieldDef>> {
        match &def.kind {
            TypeKind::Composite {
                fields,
                parent,
                interfaces,
            } => {
                let mut merged: Vec<FieldDef> = Vec::new();
                if let Some(parent) = parent {
                    merged = self.effective_fields(parent)?;
                }
                for iface in interfaces {
                    for field in self.effective_fields(iface)? {
                        merge_field(&mut merged, field, &def.name)?;
                    }
                }
                for field in fields {
                    ensure!(
                        !merged.iter().any(|f| f.name == field.name),
                        "field '{}' in '{}' collides with an inherited field",
                        field.name,
                        def.name
                    );
                    merged.push(field.clone());
                }
                Ok(merged)
            }
            TypeKind::Interface { fields, parents } => {
                let mut merged: Vec<FieldDef> = Vec::new();
                for parent in parents {
                    for field in self.effective_fields(parent)? {
                        merge_field(&mut merged, field, &def.name)?;
                    }
                }
                for field in fields {
                    merge_field(&mut merged, field.clone(), &def.name)?;
                }
                Ok(merged)
            }
            _ => bail!("'{}' has no fields; not a composite or interface", def.name),
        }
    }

    /// True when `composite` transitively implements `interface`.
    pub fn implements(&self, composite: &str, interface: &str) -> Result<bool> {
        Ok(self.implementers_of(interface)?.iter().any(|c| c == composite))
    }

    /// Every composite that transitively implements `interface`, sorted.
    pub fn implementers_of(&self, interface: &str) -> Result<Vec<String>> {
        ensure!(
            self.get(interface)?.is_interface(),
            "'{}' is not an interface",
            interface
        );

        let mut cache = self.implementers.lock();
        if cache.is_none() {
            *cache = Some(self.build_implementers());
        }
        Ok(cache
            .as_ref()
            .unwrap()
            .get(interface)
            .cloned()
            .unwrap_or_default())
    }

    fn build_implementers(&self) -> HashMap<String, Vec<String>> {
        // descendants[I] = interfaces reachable from I via parent edges
        // reversed, I included.
        let interfaces: Vec<&TypeDef> =
            self.types.values().filter(|d| d.is_interface()).collect();

        let mut map = HashMap::new();
        for iface in &interfaces {
            let mut descendants = HashSet::new();
            let mut queue = vec![iface.name.clone()];
            while let Some(current) = queue.pop() {
                if !descendants.insert(current.clone()) {
                    continue;
                }
                for candidate in &interfaces {
                    if let TypeKind::Interface { parents, .. } = &candidate.kind {
                        if parents.contains(&current) {
                            queue.push(candidate.name.clone());
                        }
                    }
                }
            }

            let mut implementers: Vec<String> = self
                .types
                .values()
                .filter(|d| d.is_composite())
                .filter(|d| {
                    self.declared_interfaces_with_ancestors(&d.name)
                        .iter()
                        .any(|i| descendants.contains(i))
                })
                .map(|d| d.name.clone())
                .collect();
            implementers.sort();
            map.insert(iface.name.clone(), implementers);
        }
        map
    }

    /// Interfaces declared by `composite` or any composite ancestor.
    fn declared_interfaces_with_ancestors(&self, composite: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = Some(composite.to_string());
        while let Some(name) = current {
            match self.types.get(&name).map(|d| &d.kind) {
                Some(TypeKind::Composite {
                    interfaces, parent, ..
                }) => {
                    out.extend(interfaces.iter().cloned());
                    current = parent.clone();
                }
                _ => current = None,
            }
        }
        out
    }

    /// Every `(owner, field)` whose declared type is or contains `name`.
    /// Owners are composites and enum variants (`Enum::Variant`).
    pub fn references_to(&self, name: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for type_name in self.sorted_names() {
            match &self.types[&type_name].kind {
                TypeKind::Composite { fields, .. } => {
                    for field in fields {
                        if self.type_mentions(&field.type_name, name) {
                            out.push((type_name.clone(), field.name.clone()));
                        }
                    }
                }
                TypeKind::Enum { variants, .. } => {
                    for variant in variants {
                        for field in &variant.fields {
                            if self.type_mentions(&field.type_name, name) {
                                out.push((
                                    format!("{}::{}", type_name, variant.name),
                                    field.name.clone(),
                                ));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn type_mentions(&self, type_name: &str, target: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue = vec![type_name.to_string()];
        while let Some(current) = queue.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            match self.types.get(&current).map(|d| &d.kind) {
                Some(TypeKind::Alias { target: t }) => queue.push(t.clone()),
                Some(TypeKind::Array { element }) | Some(TypeKind::Set { element }) => {
                    queue.push(element.clone())
                }
                Some(TypeKind::Dictionary { key, value, .. }) => {
                    queue.push(key.clone());
                    queue.push(value.clone());
                }
                Some(TypeKind::StringType) => queue.push("character".to_string()),
                _ => {}
            }
        }
        false
    }

    /// Gets or registers the array type of `element`.
    pub fn ensure_array(&mut self, element: &str) -> Result<String> {
        let name = array_name(element);
        if let Some(def) = self.types.get(&name) {
            ensure!(
                matches!(def.kind, TypeKind::Array { .. }),
                "type '{}' exists but is not an array",
                name
            );
            return Ok(name);
        }
        self.register(TypeDef {
            name: name.clone(),
            kind: TypeKind::Array {
                element: element.to_string(),
            },
        })?;
        Ok(name)
    }

    /// Gets or registers the set type of `element`.
    pub fn ensure_set(&mut self, element: &str) -> Result<String> {
        let name = set_name(element);
        if let Some(def) = self.types.get(&name) {
            ensure!(
                matches!(def.kind, TypeKind::Set { .. }),
                "type '{}' exists but is not a set",
                name
            );
            return Ok(name);
        }
        self.register(TypeDef {
            name: name.clone(),
            kind: TypeKind::Set {
                element: element.to_string(),
            },
        })?;
        Ok(name)
    }

    /// Gets or registers the dictionary type of `key -> value`, together
    /// with its synthetic entry composite `Dict_<K>_<V>`.
    pub fn ensure_dictionary(&mut self, key: &str, value: &str) -> Result<String> {
        let name = dictionary_name(key, value);
        if let Some(def) = self.types.get(&name) {
            ensure!(
                matches!(def.kind, TypeKind::Dictionary { .. }),
                "type '{}' exists but is not a dictionary",
                name
            );
            return Ok(name);
        }

        let entry = dict_entry_name(key, value);
        if !self.types.contains_key(&entry) {
            self.register(TypeDef::composite(
                entry.clone(),
                vec![FieldDef::new("key", key), FieldDef::new("value", value)],
            ))?;
        }

        self.register(TypeDef {
            name: name.clone(),
            kind: TypeKind::Dictionary {
                key: key.to_string(),
                value: value.to_string(),
                entry,
            },
        })?;
        Ok(name)
    }

    /// Removes a composite's definition. Its table catalog is dropped by
    /// the engine; element stores are shared and survive. The type-id is
    /// never recycled.
    pub fn drop_composite(&mut self, name: &str) -> Result<()> {
        let def = self.get(name)?;
        ensure!(def.is_composite(), "'{}' is not a composite", name);

        let dependents = self.references_to(name);
        let external: Vec<_> = dependents
            .iter()
            .filter(|(owner, _)| owner != name && !owner.starts_with(&format!("{}::", name)))
            .collect();
        ensure!(
            external.is_empty(),
            "cannot drop '{}': still referenced by {:?}",
            name,
            external
        );

        self.types.remove(name);
        *self.implementers.lock() = None;
        Ok(())
    }

    /// Trusted insertion used by metadata load; skips dependency-order
    /// validation.
    pub(crate) fn insert_unchecked(&mut self, def: TypeDef) {
        self.types.insert(def.name.clone(), def);
        *self.implementers.lock() = None;
    }

    pub(crate) fn restore_type_id(&mut self, name: &str, id: u16) {
        self.type_ids.insert(name.to_string(), id);
        self.ids_to_names.insert(id, name.to_string());
        if id >= self.next_type_id {
            self.next_type_id = id + 1;
        }
    }

    /// Validates types restored by `insert_unchecked` as a whole.
    pub(crate) fn validate_all(&self) -> Result<()> {
        for def in self.types.values() {
            self.validate(def)?;
        }
        Ok(())
    }

    /// Assigns ids to composites that lack one (used after metadata load).
    pub(crate) fn assign_missing_type_ids(&mut self) -> Result<()> {
        for name in self.sorted_names() {
            if self.types[&name].is_composite() && !self.type_ids.contains_key(&name) {
                let id = self.next_type_id;
                ensure!(id < u16::MAX, "type-id space exhausted");
                self.next_type_id += 1;
                self.type_ids.insert(name.clone(), id);
                self.ids_to_names.insert(id, name);
            }
        }
        Ok(())
    }
}

fn merge_field(merged: &mut Vec<FieldDef>, field: FieldDef, owner: &str) -> Result<()> {
    if let Some(existing) = merged.iter().find(|f| f.name == field.name) {
        ensure!(
            existing.type_name == field.type_name,
            "field '{}' in '{}' inherited with conflicting types '{}' and '{}'",
            field.name,
            owner,
            existing.type_name,
            field.type_name
        );
        return Ok(());
    }
    merged.push(field);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
    }

    #[test]
    fn builtins_are_registered() {
        let reg = registry();
        for name in ["uint8", "int128", "float64", "character", "boolean",
                     "string", "bigint", "biguint", "fraction"] {
            assert!(reg.contains(name), "{}", name);
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut reg = registry();
        reg.register(TypeDef::composite("P", vec![FieldDef::new("x", "uint8")]))
            .unwrap();
        let err = reg
            .register(TypeDef::composite("P", vec![FieldDef::new("y", "uint8")]))
            .unwrap_err();
        assert!(err.to_string().contains("already defined"));
    }

    #[test]
    fn alias_resolves_transitively() {
        let mut reg = registry();
        reg.register(TypeDef::alias("Name", "string")).unwrap();
        reg.register(TypeDef::alias("Title", "Name")).unwrap();
        assert_eq!(reg.resolve("Title").unwrap().name, "string");
    }

    #[test]
    fn alias_to_unknown_type_is_rejected() {
        let mut reg = registry();
        assert!(reg.register(TypeDef::alias("X", "missing")).is_err());
    }

    #[test]
    fn stub_is_idempotent_and_conflicts_with_real_types() {
        let mut reg = registry();
        reg.register_stub("Node").unwrap();
        reg.register_stub("Node").unwrap();
        assert_eq!(reg.unpopulated_stubs(), vec!["Node".to_string()]);

        assert!(reg.register_stub("uint8").is_err());

        reg.register(TypeDef::composite(
            "Node",
            vec![FieldDef::new("next", "Node")],
        ))
        .unwrap();
        assert!(reg.unpopulated_stubs().is_empty());
    }

    #[test]
    fn self_referential_composite_is_allowed() {
        let mut reg = registry();
        reg.register(TypeDef::composite(
            "N",
            vec![FieldDef::new("name", "string"), FieldDef::new("next", "N")],
        ))
        .unwrap();
        assert!(reg.get("N").is_ok());
    }

    #[test]
    fn zero_field_composites_register_but_have_no_layout() {
        // Registration succeeds (interface markers need it); the layout
        // layer rejects materialisation.
        let mut reg = registry();
        reg.register(TypeDef::composite("Empty", vec![])).unwrap();
        assert!(reg.effective_fields("Empty").unwrap().is_empty());
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let mut reg = registry();
        let err = reg
            .register(TypeDef::composite(
                "P",
                vec![FieldDef::new("x", "uint8"), FieldDef::new("x", "uint16")],
            ))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate field"));
    }

    #[test]
    fn overflow_requires_integer_kind() {
        let mut reg = registry();
        let err = reg
            .register(TypeDef::composite(
                "P",
                vec![FieldDef::new("s", "string")
                    .with_overflow(crate::schema::OverflowPolicy::Saturating)],
            ))
            .unwrap_err();
        assert!(err.to_string().contains("integer"));

        reg.register(TypeDef::composite(
            "Q",
            vec![FieldDef::new("x", "int8")
                .with_overflow(crate::schema::OverflowPolicy::Wrapping)],
        ))
        .unwrap();
    }

    #[test]
    fn composite_inheritance_orders_fields() {
        let mut reg = registry();
        reg.register(TypeDef::composite("Base", vec![FieldDef::new("id", "uint32")]))
            .unwrap();
        reg.register(TypeDef::composite_with(
            "Child",
            vec![FieldDef::new("name", "string")],
            Some("Base".into()),
            vec![],
        ))
        .unwrap();

        let fields = reg.effective_fields("Child").unwrap();
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name"]);
        assert_eq!(reg.ancestors_of("Child").unwrap(), vec!["Base".to_string()]);
    }

    #[test]
    fn interface_fields_flow_into_composites() {
        let mut reg = registry();
        reg.register(TypeDef::interface(
            "Named",
            vec![FieldDef::new("name", "string")],
            vec![],
        ))
        .unwrap();
        reg.register(TypeDef::composite_with(
            "Person",
            vec![FieldDef::new("age", "uint8")],
            None,
            vec!["Named".into()],
        ))
        .unwrap();

        let names: Vec<String> = reg
            .effective_fields("Person")
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["name", "age"]);
    }

    #[test]
    fn diamond_interface_merge_deduplicates() {
        let mut reg = registry();
        reg.register(TypeDef::interface("A", vec![FieldDef::new("id", "uint32")], vec![]))
            .unwrap();
        reg.register(TypeDef::interface(
            "B",
            vec![FieldDef::new("x", "uint8")],
            vec!["A".into()],
        ))
        .unwrap();
        reg.register(TypeDef::interface(
            "C",
            vec![FieldDef::new("y", "uint8")],
            vec!["A".into()],
        ))
        .unwrap();
        reg.register(TypeDef::composite_with(
            "T",
            vec![FieldDef::new("z", "uint8")],
            None,
            vec!["B".into(), "C".into()],
        ))
        .unwrap();

        let names: Vec<String> = reg
            .effective_fields("T")
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["id", "x", "y", "z"]);
    }

    #[test]
    fn conflicting_inherited_field_types_are_rejected() {
        let mut reg = registry();
        reg.register(TypeDef::interface("A", vec![FieldDef::new("id", "uint32")], vec![]))
            .unwrap();
        reg.register(TypeDef::interface("B", vec![FieldDef::new("id", "string")], vec![]))
            .unwrap();
        let err = reg
            .register(TypeDef::composite_with(
                "T",
                vec![FieldDef::new("z", "uint8")],
                None,
                vec!["A".into(), "B".into()],
            ))
            .unwrap_err();
        assert!(err.to_string().contains("conflicting types"));
    }

    #[test]
    fn implementers_follow_interface_descendants() {
        let mut reg = registry();
        reg.register(TypeDef::interface("I1", vec![], vec![])).unwrap();
        reg.register(TypeDef::interface("I2", vec![], vec!["I1".into()]))
            .unwrap();
        reg.register(TypeDef::composite_with(
            "T",
            vec![FieldDef::new("x", "uint8")],
            None,
            vec!["I2".into()],
        ))
        .unwrap();

        assert_eq!(reg.implementers_of("I1").unwrap(), vec!["T".to_string()]);
        assert_eq!(reg.implementers_of("I2").unwrap(), vec!["T".to_string()]);
        assert!(reg.implements("T", "I1").unwrap());
    }

    #[test]
    fn implementers_include_composite_descendants() {
        let mut reg = registry();
        reg.register(TypeDef::interface("I", vec![], vec![])).unwrap();
        reg.register(TypeDef::composite_with(
            "Base",
            vec![FieldDef::new("x", "uint8")],
            None,
            vec!["I".into()],
        ))
        .unwrap();
        reg.register(TypeDef::composite_with(
            "Child",
            vec![FieldDef::new("y", "uint8")],
            Some("Base".into()),
            vec![],
        ))
        .unwrap();

        assert_eq!(
            reg.implementers_of("I").unwrap(),
            vec!["Base".to_string(), "Child".to_string()]
        );
    }

    #[test]
    fn implementers_cache_invalidates_on_registration() {
        let mut reg = registry();
        reg.register(TypeDef::interface("I", vec![], vec![])).unwrap();
        assert!(reg.implementers_of("I").unwrap().is_empty());

        reg.register(TypeDef::composite_with(
            "T",
            vec![FieldDef::new("x", "uint8")],
            None,
            vec!["I".into()],
        ))
        .unwrap();
        assert_eq!(reg.implementers_of("I").unwrap(), vec!["T".to_string()]);
    }

    #[test]
    fn type_ids_are_stable_and_unique() {
        let mut reg = registry();
        reg.register(TypeDef::composite("A", vec![FieldDef::new("x", "uint8")]))
            .unwrap();
        reg.register(TypeDef::composite("B", vec![FieldDef::new("x", "uint8")]))
            .unwrap();

        let a = reg.type_id("A").unwrap();
        let b = reg.type_id("B").unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.type_name_by_id(a), Some("A"));
        assert!(reg.type_id("uint8").is_err());
    }

    #[test]
    fn references_to_traverses_containers() {
        let mut reg = registry();
        reg.register(TypeDef::composite("P", vec![FieldDef::new("x", "uint8")]))
            .unwrap();
        reg.ensure_array("P").unwrap();
        reg.register(TypeDef::composite(
            "Q",
            vec![
                FieldDef::new("one", "P"),
                FieldDef::new("many", "P[]"),
                FieldDef::new("n", "uint32"),
            ],
        ))
        .unwrap();

        let uses = reg.references_to("P");
        assert_eq!(
            uses,
            vec![
                ("Q".to_string(), "one".to_string()),
                ("Q".to_string(), "many".to_string())
            ]
        );
    }

    #[test]
    fn dictionary_registers_entry_composite() {
        let mut reg = registry();
        let name = reg.ensure_dictionary("string", "uint8").unwrap();
        assert_eq!(name, "dictionary<string,uint8>");

        let entry = reg.get("Dict_string_uint8").unwrap();
        assert!(entry.is_composite());
        let fields = reg.effective_fields("Dict_string_uint8").unwrap();
        assert_eq!(fields[0].name, "key");
        assert_eq!(fields[1].name, "value");
        assert!(reg.type_id("Dict_string_uint8").is_ok());
    }

    #[test]
    fn arrays_of_big_numerics_are_rejected() {
        let mut reg = registry();
        assert!(reg.ensure_array("bigint").is_err());
        assert!(reg.ensure_array("fraction").is_err());
        assert!(reg.ensure_set("biguint").is_err());
    }

    #[test]
    fn nested_array_types_register() {
        let mut reg = registry();
        reg.ensure_array("uint8").unwrap();
        let name = reg.ensure_array("uint8[]").unwrap();
        assert_eq!(name, "uint8[][]");
        reg.ensure_array("string").unwrap();
    }

    #[test]
    fn drop_composite_refuses_while_referenced() {
        let mut reg = registry();
        reg.register(TypeDef::composite("P", vec![FieldDef::new("x", "uint8")]))
            .unwrap();
        reg.register(TypeDef::composite("Q", vec![FieldDef::new("p", "P")]))
            .unwrap();

        assert!(reg.drop_composite("P").is_err());
        reg.drop_composite("Q").unwrap();
        reg.drop_composite("P").unwrap();
        assert!(!reg.contains("P"));
    }

    #[test]
    fn interface_cycle_is_rejected() {
        let mut reg = registry();
        // Parents must pre-exist as interfaces, so the only route to a
        // cycle is self-parenting through a stub; both forms must fail.
        reg.register_stub("B").unwrap();
        assert!(reg
            .register(TypeDef::interface("B", vec![], vec!["B".into()]))
            .is_err());
        assert!(reg
            .register(TypeDef::interface("C", vec![], vec!["C".into()]))
            .is_err());
    }
}
