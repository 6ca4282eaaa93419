//! Topological resolution of a package subset: Kahn's algorithm over the
//! `dependencies` edges, with cycle detection.

use anyhow::{Result, bail};
use indexmap::{IndexMap, IndexSet};

use crate::error::RelkitError;
use crate::params::Package;

/// Topologically sort `packages` (every dependency precedes its dependents).
///
/// `packages` must already be the selected subset (see the builder's
/// candidate/selection step); every `dependency.identifier` referenced by a
/// package in the set must also be a key of `packages`, or
/// [`RelkitError::MissingDependencyError`] is raised.
pub fn topo_sort(packages: &IndexMap<String, Package>) -> Result<Vec<String>> {
    for pkg in packages.values() {
        for dep in &pkg.dependencies {
            if !packages.contains_key(&dep.identifier) {
                bail!(RelkitError::MissingDependencyError(format!(
                    "{} depends on unknown package {}",
                    pkg.identifier, dep.identifier
                )));
            }
        }
    }

    let mut in_degree: IndexMap<&str, usize> = packages
        .values()
        .map(|pkg| (pkg.identifier.as_str(), pkg.dependencies.len()))
        .collect();

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    queue.sort();

    let mut order = Vec::with_capacity(packages.len());
    let mut visited: IndexSet<&str> = IndexSet::new();

    while let Some(id) = queue.pop() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id.to_string());

        let mut newly_ready = Vec::new();
        for pkg in packages.values() {
            if pkg.dependencies.iter().any(|d| d.identifier == id) {
                let degree = in_degree.get_mut(pkg.identifier.as_str()).unwrap();
                *degree -= 1;
                if *degree == 0 && !visited.contains(pkg.identifier.as_str()) {
                    newly_ready.push(pkg.identifier.as_str());
                }
            }
        }
        newly_ready.sort();
        queue.extend(newly_ready);
    }

    if order.len() != packages.len() {
        let participants: Vec<String> = packages
            .keys()
            .filter(|id| !visited.contains(id.as_str()))
            .cloned()
            .collect();
        bail!(RelkitError::DependencyCycleError { participants });
    }

    Ok(order)
}

/// Collect the identifiers of dependencies declared `for_machine: "build"`
/// among `selected`, so the builder can also build them for the build machine.
pub fn also_for_build(packages: &IndexMap<String, Package>, selected: &[String]) -> Vec<String> {
    let selected_set: IndexSet<&str> = selected.iter().map(|s| s.as_str()).collect();
    let mut out = IndexSet::new();
    for id in selected {
        if let Some(pkg) = packages.get(id) {
            for dep in &pkg.dependencies {
                if dep.for_machine == crate::params::ForMachine::Build
                    && selected_set.contains(dep.identifier.as_str())
                {
                    out.insert(dep.identifier.clone());
                }
            }
        }
    }
    out.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Dependency;
    use pretty_assertions::assert_eq;

    fn pkg(id: &str, deps: &[&str]) -> Package {
        Package {
            identifier: id.to_string(),
            name: id.to_string(),
            display_url: format!("https://example.org/{id}.git"),
            version: "deadbeef".to_string(),
            options: Vec::new(),
            dependencies: deps
                .iter()
                .map(|d| Dependency {
                    identifier: d.to_string(),
                    for_machine: crate::params::ForMachine::Host,
                })
                .collect(),
            scope: None,
        }
    }

    #[test]
    fn orders_a_simple_chain() {
        let mut packages = IndexMap::new();
        packages.insert("b".to_string(), pkg("b", &["a"]));
        packages.insert("a".to_string(), pkg("a", &[]));

        let order = topo_sort(&packages).unwrap();
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn cross_build_selection_shape() {
        // A -> B, C -> D, as in spec scenario S6.
        let mut packages = IndexMap::new();
        packages.insert("a".to_string(), pkg("a", &["b"]));
        packages.insert("b".to_string(), pkg("b", &[]));
        let order = topo_sort(&packages).unwrap();
        assert_eq!(order, vec!["b".to_string(), "a".to_string()]);

        let mut sdk_packages = IndexMap::new();
        sdk_packages.insert("c".to_string(), pkg("c", &["d"]));
        sdk_packages.insert("d".to_string(), pkg("d", &[]));
        let order = topo_sort(&sdk_packages).unwrap();
        assert_eq!(order, vec!["d".to_string(), "c".to_string()]);
    }

    #[test]
    fn cycle_is_fatal() {
        let mut packages = IndexMap::new();
        packages.insert("x".to_string(), pkg("x", &["y"]));
        packages.insert("y".to_string(), pkg("y", &["x"]));

        let err = topo_sort(&packages).unwrap_err();
        let relkit_err = err.downcast_ref::<RelkitError>().unwrap();
        assert!(matches!(relkit_err, RelkitError::DependencyCycleError { .. }));
    }

    #[test]
    fn unknown_dependency_is_missing_dependency_error() {
        let mut packages = IndexMap::new();
        packages.insert("a".to_string(), pkg("a", &["ghost"]));

        let err = topo_sort(&packages).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelkitError>(),
            Some(RelkitError::MissingDependencyError(_))
        ));
    }

    #[test]
    fn every_dependency_precedes_its_dependent() {
        let mut packages = IndexMap::new();
        packages.insert("a".to_string(), pkg("a", &[]));
        packages.insert("b".to_string(), pkg("b", &["a"]));
        packages.insert("c".to_string(), pkg("c", &["a", "b"]));

        let order = topo_sort(&packages).unwrap();
        for pkg in packages.values() {
            for dep in &pkg.dependencies {
                let dep_idx = order.iter().position(|id| id == &dep.identifier).unwrap();
                let pkg_idx = order.iter().position(|id| id == &pkg.identifier).unwrap();
                assert!(dep_idx < pkg_idx);
            }
        }
    }

    #[test]
    fn also_for_build_collects_build_machine_deps() {
        let mut packages = IndexMap::new();
        packages.insert(
            "a".to_string(),
            Package {
                identifier: "a".to_string(),
                name: "a".to_string(),
                display_url: "https://example.org/a.git".to_string(),
                version: "x".to_string(),
                options: Vec::new(),
                dependencies: vec![Dependency {
                    identifier: "tool".to_string(),
                    for_machine: crate::params::ForMachine::Build,
                }],
                scope: None,
            },
        );
        packages.insert("tool".to_string(), pkg("tool", &[]));

        let selected = vec!["a".to_string(), "tool".to_string()];
        let build_only = also_for_build(&packages, &selected);
        assert_eq!(build_only, vec!["tool".to_string()]);
    }
}
