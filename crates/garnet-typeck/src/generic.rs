//! Generic specialization cache and the proxy state machine.
//!
//! A specialization is keyed by its template and the instance-variable
//! bindings sorted by name, so equal bindings always yield the same
//! `TypeId`. When the bindings come from graph nodes that are still being
//! inferred, the node holding the generic value gets a proxy instead. The
//! proxy observes the binding nodes and, whenever they change to something
//! that yields a different specialization, hands the holder a successor
//! proxy and becomes a forwarding link to it.

use tracing::debug;

use crate::error::TypeError;
use crate::graph::{NodeId, Observer, TypeGraph};
use crate::registry::TypeRegistry;
use crate::ty::{ObjectType, ProxyState, ProxyType, Type, TypeId};

impl TypeRegistry {
    /// The specialization of `template` for `bindings`, created on first use.
    ///
    /// `template` may itself be a specialization; its template is used.
    pub fn instantiate(
        &mut self,
        template: TypeId,
        bindings: &[(String, TypeId)],
    ) -> Result<TypeId, TypeError> {
        let template = self.generic_template(template)?;
        let mut key: Vec<(String, TypeId)> = bindings
            .iter()
            .map(|(name, ty)| (name.clone(), self.resolve(*ty)))
            .collect();
        key.sort_by(|a, b| a.0.cmp(&b.0));

        let cache_key = (template, key);
        if let Some(&instance) = self.generics.get(&cache_key) {
            return Ok(instance);
        }
        let instance = self.clone_for_specialization(template, &cache_key.1);
        debug!(instance = %self.display(instance), "instantiated generic type");
        self.generics.insert(cache_key, instance);
        Ok(instance)
    }

    fn generic_template(&self, ty: TypeId) -> Result<TypeId, TypeError> {
        let ty = self.resolve(ty);
        match self.get(ty) {
            Type::Object(ObjectType {
                template: Some(template),
                ..
            }) => Ok(*template),
            Type::Object(obj) if obj.generic => Ok(ty),
            _ => Err(TypeError::internal(format!(
                "`{}` is not a generic type",
                self.display(ty)
            ))),
        }
    }

    /// Copy the instance-variable slots of `template`, overlaying
    /// `bindings`. Method tables, nested types and ancestors stay shared
    /// through the template's class table.
    pub fn clone_for_specialization(&mut self, template: TypeId, bindings: &[(String, TypeId)]) -> TypeId {
        let (class, mut instance_vars) = match self.get(template) {
            Type::Object(obj) => (obj.class, obj.instance_vars.clone()),
            _ => return template,
        };
        for (name, ty) in bindings {
            instance_vars.insert(name.clone(), Some(*ty));
        }
        self.push_type(Type::Object(ObjectType {
            class,
            instance_vars,
            generic: true,
            template: Some(template),
        }))
    }
}

/// Current bindings of `observed` and whether all of them are typed.
fn current_bindings(graph: &TypeGraph, observed: &[(String, NodeId)]) -> (Vec<(String, TypeId)>, bool) {
    let mut complete = true;
    let mut bindings = Vec::with_capacity(observed.len());
    for (name, node) in observed {
        match graph.type_of(*node) {
            Some(ty) => bindings.push((name.clone(), ty)),
            None => complete = false,
        }
    }
    (bindings, complete)
}

fn state_for(target: TypeId, complete: bool) -> ProxyState {
    if complete {
        ProxyState::Resolved { target }
    } else {
        ProxyState::Pending { target }
    }
}

/// Give `holder` a proxy for the specialization of `template` bound by the
/// types of the `observed` nodes.
pub fn install_proxy(
    reg: &mut TypeRegistry,
    graph: &mut TypeGraph,
    template: TypeId,
    observed: Vec<(String, NodeId)>,
    holder: NodeId,
) -> Result<TypeId, TypeError> {
    let (bindings, complete) = current_bindings(graph, &observed);
    let target = reg.instantiate(template, &bindings)?;
    let proxy = reg.push_type(Type::Proxy(ProxyType {
        template,
        observed: observed.clone(),
        holder,
        state: state_for(target, complete),
        generation: 0,
    }));
    for (_, node) in &observed {
        graph.observe(*node, Observer::Proxy(proxy));
    }
    graph.set_type(holder, proxy);
    Ok(proxy)
}

/// React to a change of one of the nodes `proxy` observes.
///
/// If the bindings still yield the same specialization the proxy stays,
/// possibly moving from pending to resolved. Otherwise the holder gets a
/// successor proxy first, then this one is marked superseded and its
/// observations move to the successor. A chain longer than
/// `max_generations` is an internal error.
pub fn refresh_proxy(
    reg: &mut TypeRegistry,
    graph: &mut TypeGraph,
    proxy: TypeId,
    max_generations: u32,
) -> Result<(), TypeError> {
    let Some(current) = reg.get(proxy).as_proxy().cloned() else {
        return Err(TypeError::internal("woke a proxy that is not a proxy type"));
    };
    let Some(old_target) = current.target() else {
        return Ok(());
    };

    let (bindings, complete) = current_bindings(graph, &current.observed);
    let target = reg.instantiate(current.template, &bindings)?;
    if target == old_target {
        if let Type::Proxy(p) = reg.get_mut(proxy) {
            p.state = state_for(target, complete);
        }
        return Ok(());
    }

    let generation = current.generation + 1;
    if generation > max_generations {
        return Err(TypeError::internal(format!(
            "generic proxy for `{}` superseded more than {} times",
            reg.display(current.template),
            max_generations
        )));
    }

    let successor = reg.push_type(Type::Proxy(ProxyType {
        template: current.template,
        observed: current.observed.clone(),
        holder: current.holder,
        state: state_for(target, complete),
        generation,
    }));
    graph.set_type(current.holder, successor);
    if let Type::Proxy(p) = reg.get_mut(proxy) {
        p.state = ProxyState::Superseded { by: successor };
    }
    for (_, node) in &current.observed {
        graph.unobserve(*node, Observer::Proxy(proxy));
        graph.observe(*node, Observer::Proxy(successor));
    }
    debug!(
        from = %reg.display(old_target),
        to = %reg.display(target),
        generation,
        "proxy superseded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Wake;
    use garnet_common::Location;

    #[test]
    fn equal_bindings_share_one_instance() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let int_buf = reg.pointer_of(b.int);
        let first = reg
            .instantiate(b.array, &[("@buffer".into(), int_buf)])
            .unwrap();
        let second = reg
            .instantiate(b.array, &[("@buffer".into(), int_buf)])
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(reg.display(first), "Array<Int>");

        let float_buf = reg.pointer_of(b.float);
        let other = reg
            .instantiate(b.array, &[("@buffer".into(), float_buf)])
            .unwrap();
        assert_ne!(first, other);
        assert_eq!(reg.display(other), "Array<Float>");
    }

    #[test]
    fn binding_order_does_not_matter() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let pair = reg.add_object_type("Pair", Some(b.object), b.main, true);
        let ab = reg
            .instantiate(pair, &[("@a".into(), b.int), ("@b".into(), b.char)])
            .unwrap();
        let ba = reg
            .instantiate(pair, &[("@b".into(), b.char), ("@a".into(), b.int)])
            .unwrap();
        assert_eq!(ab, ba);
        assert_eq!(reg.display(ab), "Pair<@a: Int, @b: Char>");
    }

    #[test]
    fn specializations_share_class_tables_and_keep_slots() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let buf = reg.pointer_of(b.char);
        let inst = reg.instantiate(b.array, &[("@buffer".into(), buf)]).unwrap();
        assert_eq!(reg.class_of(inst), reg.class_of(b.array));
        assert_eq!(reg.parents(inst), reg.parents(b.array));
        assert_eq!(reg.instance_var(inst, "@length"), Some(Some(b.int)));
        assert_eq!(reg.instance_var(inst, "@buffer"), Some(Some(buf)));
        assert_eq!(reg.instance_var(b.array, "@buffer"), None);
        // Re-specializing a specialization goes through the template.
        let again = reg.instantiate(inst, &[("@buffer".into(), buf)]).unwrap();
        assert_eq!(again, inst);
    }

    #[test]
    fn independent_clones_compare_equal() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let buf = reg.pointer_of(b.int);
        let first = reg.clone_for_specialization(b.array, &[("@buffer".into(), buf)]);
        let second = reg.clone_for_specialization(b.array, &[("@buffer".into(), buf)]);
        assert_ne!(first, second);
        assert!(reg.types_equal(first, second));
    }

    #[test]
    fn non_generic_types_cannot_be_instantiated() {
        let mut reg = TypeRegistry::new();
        let b = *reg.builtins();
        let err = reg.instantiate(b.string, &[]).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn proxy_is_superseded_when_bindings_change() {
        let mut reg = TypeRegistry::new();
        let mut graph = TypeGraph::new(10_000);
        let b = *reg.builtins();

        let elem = graph.add_node(Location::synthetic());
        let buffer = graph.add_pointer_node(Location::synthetic());
        graph.bind_to(&mut reg, buffer, elem);
        let holder = graph.add_node(Location::synthetic());
        let first =
            install_proxy(&mut reg, &mut graph, b.array, vec![("@buffer".into(), buffer)], holder).unwrap();
        assert_eq!(graph.type_of(holder), Some(first));
        assert!(matches!(
            reg.get(first).as_proxy().unwrap().state,
            ProxyState::Pending { .. }
        ));

        let int = graph.typed_node(b.int, Location::synthetic());
        graph.bind_to(&mut reg, elem, int);
        let wakes = graph.propagate(&mut reg).unwrap();
        assert_eq!(wakes, vec![Wake::Proxy(first)]);
        refresh_proxy(&mut reg, &mut graph, first, 8).unwrap();

        let second = graph.type_of(holder).unwrap();
        assert_ne!(second, first);
        assert!(reg.get(first).as_proxy().unwrap().is_dead());
        assert_eq!(reg.display(second), "Array<Int>");
        // The dead proxy forwards to its successor's target.
        assert_eq!(reg.resolve(first), reg.resolve(second));
        assert!(reg.types_equal(first, second));

        // A stale wake of the dead proxy is ignored.
        refresh_proxy(&mut reg, &mut graph, first, 8).unwrap();
        assert_eq!(graph.type_of(holder), Some(second));

        // Same bindings again: no new proxy.
        graph.propagate(&mut reg).unwrap();
        refresh_proxy(&mut reg, &mut graph, second, 8).unwrap();
        assert_eq!(graph.type_of(holder), Some(second));
        assert!(matches!(
            reg.get(second).as_proxy().unwrap().state,
            ProxyState::Resolved { .. }
        ));
    }

    #[test]
    fn proxy_chain_is_bounded() {
        let mut reg = TypeRegistry::new();
        let mut graph = TypeGraph::new(10_000);
        let b = *reg.builtins();
        let elem = graph.add_node(Location::synthetic());
        let holder = graph.add_node(Location::synthetic());
        let proxy = install_proxy(&mut reg, &mut graph, b.array, vec![("@x".into(), elem)], holder).unwrap();
        graph.set_type(elem, b.int);
        let err = refresh_proxy(&mut reg, &mut graph, proxy, 0).unwrap_err();
        assert!(err.is_internal());
    }
}
