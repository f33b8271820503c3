//! Which components take part in an operation.
//!
//! A component is included when it is explicitly selected, when an included
//! ancestor covers it and it cannot be selected on its own, or when it cannot
//! be selected and has no selectable ancestor (it would otherwise never be
//! included). Dependencies of included components are pulled in transitively,
//! across writers.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::catalog::{ComponentInfo, ComponentKey, InstanceId, WriterMetadata};
use crate::selection::SelectionModel;

/// Which selectability flag applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Backup,
    Restore,
}

impl Purpose {
    fn selectable(self, component: &ComponentInfo) -> bool {
        match self {
            Self::Backup => component.selectable,
            Self::Restore => component.selectable_for_restore,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InclusionReason {
    /// No selection was supplied.
    Everything,
    Explicit,
    /// Covered by an included ancestor.
    Implicit,
    /// Not selectable and no selectable ancestor.
    MustInclude,
    Dependency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inclusion {
    pub instance_id: InstanceId,
    pub key: ComponentKey,
    pub reason: InclusionReason,
}

type Slot = (InstanceId, String);

fn slot(instance_id: InstanceId, key: &ComponentKey) -> Slot {
    let normalized = crate::paths::segments(&key.full_path())
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("\\");
    (instance_id, normalized)
}

/// Decide the included components of every writer, in writer and component order.
pub fn select_components(
    writers: &[WriterMetadata],
    selection: Option<&SelectionModel>,
    purpose: Purpose,
) -> Vec<Inclusion> {
    let mut included: HashMap<Slot, InclusionReason> = HashMap::new();

    for writer in writers {
        for (key, reason) in writer_inclusions(writer, selection, purpose) {
            included.insert(slot(writer.instance_id, &key), reason);
        }
    }

    close_dependencies(writers, purpose, &mut included);

    let mut ordered = Vec::with_capacity(included.len());
    for writer in writers {
        for component in &writer.components {
            let key = component.key();
            if let Some(reason) = included.get(&slot(writer.instance_id, &key)) {
                ordered.push(Inclusion {
                    instance_id: writer.instance_id,
                    key,
                    reason: *reason,
                });
            }
        }
    }
    ordered
}

fn writer_inclusions(
    writer: &WriterMetadata,
    selection: Option<&SelectionModel>,
    purpose: Purpose,
) -> Vec<(ComponentKey, InclusionReason)> {
    let Some(selection) = selection else {
        return writer
            .components
            .iter()
            .map(|c| (c.key(), InclusionReason::Everything))
            .collect();
    };

    // Writers the selection does not name still contribute their
    // must-include components.
    // Parents are decided before their children.
    let mut by_depth: Vec<&ComponentInfo> = writer.components.iter().collect();
    by_depth.sort_by_key(|c| c.key().depth());

    let mut decided: Vec<(ComponentKey, InclusionReason)> = Vec::new();
    for component in by_depth {
        let key = component.key();
        let selectable = purpose.selectable(component);
        let ancestors = writer.ancestors_of(&key);

        let reason = if selection.is_component_selected(writer.writer_id, &key) {
            Some(InclusionReason::Explicit)
        } else if !selectable
            && ancestors
                .iter()
                .any(|a| decided.iter().any(|(k, _)| k.same_as(&a.key())))
        {
            Some(InclusionReason::Implicit)
        } else if !selectable && ancestors.iter().all(|a| !purpose.selectable(a)) {
            Some(InclusionReason::MustInclude)
        } else {
            None
        };

        if let Some(reason) = reason {
            decided.push((key, reason));
        }
    }
    decided
}

fn close_dependencies(writers: &[WriterMetadata], purpose: Purpose, included: &mut HashMap<Slot, InclusionReason>) {
    let mut queue: VecDeque<(usize, ComponentKey)> = VecDeque::new();
    for (index, writer) in writers.iter().enumerate() {
        for component in &writer.components {
            if included.contains_key(&slot(writer.instance_id, &component.key())) {
                queue.push_back((index, component.key()));
            }
        }
    }

    let mut visited: HashSet<Slot> = HashSet::new();
    while let Some((index, key)) = queue.pop_front() {
        let writer = &writers[index];
        if !visited.insert(slot(writer.instance_id, &key)) {
            continue;
        }
        let Some(component) = writer.component(&key) else {
            continue;
        };

        for dependency in &component.dependencies {
            let target_key = dependency.key();
            let Some(target_index) = writers
                .iter()
                .position(|w| w.writer_id == dependency.writer_id && w.component(&target_key).is_some())
            else {
                continue;
            };
            let target = &writers[target_index];

            let mut pulled = vec![target_key.clone()];
            pulled.extend(
                target
                    .components
                    .iter()
                    .filter(|c| !purpose.selectable(c) && target_key.is_ancestor_of(&c.key()))
                    .map(|c| c.key()),
            );

            for pulled_key in pulled {
                let pulled_slot = slot(target.instance_id, &pulled_key);
                if !included.contains_key(&pulled_slot) {
                    included.insert(pulled_slot, InclusionReason::Dependency);
                }
                queue.push_back((target_index, pulled_key));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ComponentDependency, ComponentFlags, ComponentType};
    use uuid::Uuid;

    fn component(path: Option<&str>, name: &str, selectable: bool) -> ComponentInfo {
        ComponentInfo {
            component_type: ComponentType::FileGroup,
            logical_path: path.map(str::to_string),
            name: name.to_string(),
            caption: String::new(),
            selectable,
            selectable_for_restore: selectable,
            flags: ComponentFlags::default(),
            dependencies: vec![],
            files: vec![],
            database_files: vec![],
            log_files: vec![],
        }
    }

    fn writer(components: Vec<ComponentInfo>) -> WriterMetadata {
        WriterMetadata {
            writer_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            writer_name: "TestWriter".into(),
            instance_name: String::new(),
            usage_type: Default::default(),
            restore_method: Default::default(),
            alternate_location_mappings: vec![],
            include_files: vec![],
            exclude_files: vec![],
            components,
        }
    }

    fn names(inclusions: &[Inclusion]) -> Vec<String> {
        inclusions.iter().map(|i| i.key.full_path()).collect()
    }

    fn selection_for(writer: &WriterMetadata, tokens: &str) -> SelectionModel {
        SelectionModel::parse(&format!("\"{}\": {};", writer.writer_id, tokens)).unwrap()
    }

    #[test]
    fn test_no_selection_includes_everything() {
        let w = writer(vec![component(None, "a", true), component(None, "b", false)]);
        let included = select_components(&[w], None, Purpose::Backup);
        assert_eq!(names(&included), vec!["a", "b"]);
        assert!(included.iter().all(|i| i.reason == InclusionReason::Everything));
    }

    #[test]
    fn test_unnamed_writer_keeps_must_include_components() {
        let a = writer(vec![component(None, "app", true)]);
        let b = writer(vec![
            component(None, "orphan", false),
            component(Some("orphan"), "journal", false),
            component(None, "optional", true),
        ]);
        let selection = selection_for(&a, "\"app\"");

        let included = select_components(&[a, b], Some(&selection), Purpose::Backup);
        assert_eq!(names(&included), vec!["app", "orphan", "orphan\\journal"]);
        assert_eq!(included[0].reason, InclusionReason::Explicit);
        assert_eq!(included[1].reason, InclusionReason::MustInclude);

        let nothing_named = SelectionModel::parse("").unwrap();
        let lone = writer(vec![component(None, "orphan", false)]);
        let included = select_components(&[lone], Some(&nothing_named), Purpose::Backup);
        assert_eq!(names(&included), vec!["orphan"]);
    }

    #[test]
    fn test_must_include_with_non_selectable_middle() {
        // top (not selectable) > middle (not selectable) > leaf (selectable)
        let w = writer(vec![
            component(None, "top", false),
            component(Some("top"), "middle", false),
            component(Some("top\\middle"), "leaf", true),
            component(None, "other", true),
        ]);
        let selection = selection_for(&w, "\"other\"");

        let included = select_components(&[w], Some(&selection), Purpose::Backup);
        assert_eq!(names(&included), vec!["top", "top\\middle", "other"]);
        assert_eq!(included[0].reason, InclusionReason::MustInclude);
        assert_eq!(included[1].reason, InclusionReason::Implicit);
    }

    #[test]
    fn test_non_selectable_under_unselected_parent_excluded() {
        let w = writer(vec![
            component(None, "root", true),
            component(Some("root"), "middle", false),
            component(Some("root\\middle"), "leaf", false),
            component(None, "other", true),
        ]);

        let only_other = selection_for(&w, "\"other\"");
        assert_eq!(
            names(&select_components(std::slice::from_ref(&w), Some(&only_other), Purpose::Backup)),
            vec!["other"]
        );

        let root = selection_for(&w, "\"root\"");
        assert_eq!(
            names(&select_components(&[w], Some(&root), Purpose::Backup)),
            vec!["root", "root\\middle", "root\\middle\\leaf"]
        );
    }

    #[test]
    fn test_selectable_grandchild_needs_own_selection() {
        // "db" names the component and every leaf directly under the db path.
        let w = writer(vec![
            component(None, "db", true),
            component(Some("db"), "extra", true),
            component(Some("db\\extra"), "deep", true),
        ]);
        let selection = selection_for(&w, "\"db\"");
        assert_eq!(
            names(&select_components(&[w], Some(&selection), Purpose::Backup)),
            vec!["db", "db\\extra"]
        );
    }

    #[test]
    fn test_dependency_closure_across_writers() {
        let mut a = writer(vec![component(None, "app", true)]);
        let b = writer(vec![
            component(None, "store", true),
            component(Some("store"), "journal", false),
            component(None, "base", true),
            component(None, "unrelated", true),
        ]);
        let c_writer_id = b.writer_id;

        // app -> store -> base
        a.components[0].dependencies.push(ComponentDependency {
            writer_id: c_writer_id,
            logical_path: None,
            component_name: "store".into(),
        });
        let mut b = b;
        b.components[0].dependencies.push(ComponentDependency {
            writer_id: c_writer_id,
            logical_path: None,
            component_name: "base".into(),
        });

        let selection = selection_for(&a, "\"app\"");
        let included = select_components(&[a, b], Some(&selection), Purpose::Backup);
        assert_eq!(names(&included), vec!["app", "store", "store\\journal", "base"]);
        assert_eq!(included[1].reason, InclusionReason::Dependency);
    }

    #[test]
    fn test_restore_uses_restore_selectability() {
        let mut logs = component(Some("db\\part"), "logs", true);
        logs.selectable_for_restore = false;
        let w = writer(vec![component(None, "db", true), component(Some("db"), "part", true), logs]);
        let selection = selection_for(&w, "\"db\"");

        let backup = select_components(std::slice::from_ref(&w), Some(&selection), Purpose::Backup);
        assert_eq!(names(&backup), vec!["db", "db\\part"]);
        let restore = select_components(&[w], Some(&selection), Purpose::Restore);
        assert_eq!(names(&restore), vec!["db", "db\\part", "db\\part\\logs"]);
    }
}
