#[cfg(test)]
mod tests {
    use crate::*;
    use parking_lot::Mutex;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (SnapshotStore, Snapshot) {
        let store = SnapshotStore::new();
        let global = store.global_snapshot();
        (store, global)
    }

    #[test]
    fn test_global_write_is_visible() {
        let (_store, global) = setup();
        let cell = StateCell::new(&global, 1).unwrap();
        cell.set_untracked(&global, 2).unwrap();
        assert_eq!(cell.get_untracked(&global).unwrap(), 2);
    }

    #[test]
    fn test_snapshot_is_isolated_from_global_changes() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let snapshot = store.take_snapshot();
        cell.set_untracked(&global, 1).unwrap();

        assert_eq!(cell.get_untracked(&snapshot).unwrap(), 0);
        assert_eq!(cell.get_untracked(&global).unwrap(), 1);
        snapshot.dispose();
    }

    #[test]
    fn test_mutable_snapshot_reads_its_own_writes() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let snapshot = store.take_mutable_snapshot();
        cell.set_untracked(&snapshot, 5).unwrap();
        assert_eq!(cell.get_untracked(&snapshot).unwrap(), 5);
        assert_eq!(cell.get_untracked(&global).unwrap(), 0);
        assert!(snapshot.has_pending_changes());

        let changes = snapshot.apply().unwrap().check().unwrap();
        assert!(changes.contains(cell.id()));
        assert_eq!(changes.len(), 1);
        assert_eq!(cell.get_untracked(&global).unwrap(), 5);
        assert!(snapshot.is_applied());
        assert!(!snapshot.is_open());
    }

    #[test]
    fn test_concurrent_mutable_snapshots_are_isolated() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let first = store.take_mutable_snapshot();
        let second = store.take_mutable_snapshot();
        cell.set_untracked(&first, 1).unwrap();
        assert_eq!(cell.get_untracked(&second).unwrap(), 0);

        first.apply().unwrap().check().unwrap();
        assert_eq!(cell.get_untracked(&global).unwrap(), 1);
        assert_eq!(cell.get_untracked(&second).unwrap(), 0);
        second.dispose();
    }

    #[test]
    fn test_disjoint_applies_are_visible_to_later_snapshots() {
        let (store, global) = setup();
        let a = StateCell::new(&global, 0).unwrap();
        let b = StateCell::new(&global, 0).unwrap();

        let first = store.take_mutable_snapshot();
        let second = store.take_mutable_snapshot();
        a.set_untracked(&first, 1).unwrap();
        b.set_untracked(&second, 2).unwrap();
        first.apply().unwrap().check().unwrap();
        second.apply().unwrap().check().unwrap();

        let read_only = store.take_snapshot();
        let mutable = store.take_mutable_snapshot();
        for snapshot in [&read_only, &mutable, &global] {
            assert_eq!(a.get_untracked(snapshot).unwrap(), 1);
            assert_eq!(b.get_untracked(snapshot).unwrap(), 2);
        }
        read_only.dispose();
        mutable.dispose();
    }

    #[test]
    fn test_colliding_snapshots_fail_to_apply() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let first = store.take_mutable_snapshot();
        let second = store.take_mutable_snapshot();
        cell.set_untracked(&first, 1).unwrap();
        cell.set_untracked(&second, 2).unwrap();

        assert!(first.apply().unwrap().succeeded());
        match second.apply().unwrap() {
            ApplyResult::Failure(conflict) => {
                assert_eq!(conflict.cells, vec![cell.id()]);
                assert!(conflict.snapshot.is_same(&second));
            }
            ApplyResult::Success(_) => panic!("expected a conflict"),
        }
        // The failed snapshot stays open until disposed.
        assert!(second.is_open());
        let err = second.apply().unwrap().check().unwrap_err();
        assert_eq!(
            err,
            StateError::ApplyConflict {
                snapshot: second.id(),
                cells: vec![cell.id()],
            }
        );
        assert!(!second.is_open());
        assert_eq!(cell.get_untracked(&global).unwrap(), 1);
    }

    #[test]
    fn test_equal_concurrent_writes_merge() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let first = store.take_mutable_snapshot();
        let second = store.take_mutable_snapshot();
        cell.set_untracked(&first, 7).unwrap();
        cell.set_untracked(&second, 7).unwrap();

        first.apply().unwrap().check().unwrap();
        let changes = second.apply().unwrap().check().unwrap();
        // Already reported by the first apply.
        assert!(changes.is_empty());
        assert_eq!(cell.get_untracked(&global).unwrap(), 7);
    }

    #[test]
    fn test_merge_policy_combines_concurrent_writes() {
        let (store, global) = setup();
        let counter = StateCell::with_policy(
            &global,
            0i32,
            MergeWith(|previous: &i32, current: &i32, applied: &i32| {
                Some(current + applied - previous)
            }),
        )
        .unwrap();

        let first = store.take_mutable_snapshot();
        let second = store.take_mutable_snapshot();
        counter.update_untracked(&first, |v| *v += 1).unwrap();
        counter.update_untracked(&second, |v| *v += 2).unwrap();

        first.apply().unwrap().check().unwrap();
        let changes = second.apply().unwrap().check().unwrap();
        assert!(changes.contains(counter.id()));
        assert_eq!(counter.get_untracked(&global).unwrap(), 3);
    }

    #[test]
    fn test_nested_snapshot_applies_into_parent() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let parent = store.take_mutable_snapshot();
        let child = parent.take_nested_mutable_snapshot().unwrap();
        assert_eq!(parent.nested_count(), 1);
        cell.set_untracked(&child, 3).unwrap();
        assert_eq!(cell.get_untracked(&parent).unwrap(), 0);

        child.apply().unwrap().check().unwrap();
        assert_eq!(parent.nested_count(), 0);
        assert_eq!(cell.get_untracked(&parent).unwrap(), 3);
        assert_eq!(cell.get_untracked(&global).unwrap(), 0);

        parent.apply().unwrap().check().unwrap();
        assert_eq!(cell.get_untracked(&global).unwrap(), 3);
    }

    #[test]
    fn test_nested_snapshot_conflicts_with_parent_writes() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let parent = store.take_mutable_snapshot();
        cell.set_untracked(&parent, 1).unwrap();
        let child = parent.take_nested_mutable_snapshot().unwrap();
        cell.set_untracked(&parent, 2).unwrap();
        cell.set_untracked(&child, 3).unwrap();

        assert!(!child.apply().unwrap().succeeded());
        child.dispose();
        assert_eq!(cell.get_untracked(&parent).unwrap(), 2);
        parent.dispose();
    }

    #[test]
    fn test_nested_apply_fails_when_parent_closed() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let parent = store.take_mutable_snapshot();
        let child = parent.take_nested_mutable_snapshot().unwrap();
        cell.set_untracked(&child, 1).unwrap();
        parent.dispose();

        assert_eq!(
            child.apply().unwrap_err(),
            StateError::ParentClosed { snapshot: child.id() }
        );
        child.dispose();
        assert_eq!(cell.get_untracked(&global).unwrap(), 0);
    }

    #[test]
    fn test_nested_read_only_sees_parent_as_of_creation() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let parent = store.take_mutable_snapshot();
        cell.set_untracked(&parent, 1).unwrap();
        let view = parent.take_nested_snapshot().unwrap();
        cell.set_untracked(&parent, 2).unwrap();

        assert_eq!(cell.get_untracked(&view).unwrap(), 1);
        assert_eq!(cell.get_untracked(&parent).unwrap(), 2);

        let inner = view.take_nested_snapshot().unwrap();
        assert_eq!(inner.id(), view.id());
        assert_eq!(cell.get_untracked(&inner).unwrap(), 1);
    }

    #[test]
    fn test_read_only_snapshot_rejects_writes() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();
        let snapshot = store.take_snapshot();

        let err = cell.set_untracked(&snapshot, 1).unwrap_err();
        assert_eq!(err, StateError::ReadOnlyWrite { snapshot: snapshot.id() });
        assert!(matches!(
            snapshot.take_nested_mutable_snapshot(),
            Err(StateError::ReadOnlyWrite { .. })
        ));
    }

    #[test]
    fn test_dispose_abandons_writes() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let snapshot = store.take_mutable_snapshot();
        cell.set_untracked(&snapshot, 9).unwrap();
        snapshot.dispose();
        snapshot.dispose();

        assert!(!snapshot.is_open());
        assert_eq!(
            cell.get_untracked(&snapshot).unwrap_err(),
            StateError::SnapshotClosed { snapshot: snapshot.id() }
        );
        assert_eq!(cell.get_untracked(&global).unwrap(), 0);

        // Later snapshots do not see the abandoned record either.
        let later = store.take_snapshot();
        assert_eq!(cell.get_untracked(&later).unwrap(), 0);
    }

    #[test]
    fn test_apply_twice_is_an_error() {
        let (store, _global) = setup();
        let snapshot = store.take_mutable_snapshot();
        snapshot.apply().unwrap().check().unwrap();
        assert_eq!(
            snapshot.apply().unwrap_err(),
            StateError::AlreadyApplied { snapshot: snapshot.id() }
        );
    }

    #[test]
    fn test_global_snapshot_cannot_be_applied() {
        let (_store, global) = setup();
        assert_eq!(global.apply().unwrap_err(), StateError::GlobalApply);
    }

    #[test]
    fn test_cell_created_in_snapshot_is_hidden_until_applied() {
        let (store, global) = setup();
        let snapshot = store.take_mutable_snapshot();
        let cell = StateCell::new(&snapshot, 1).unwrap();

        assert!(matches!(
            cell.get_untracked(&global),
            Err(StateError::NoReadableRecord { .. })
        ));
        snapshot.apply().unwrap().check().unwrap();
        assert_eq!(cell.get_untracked(&global).unwrap(), 1);
    }

    #[test]
    fn test_apply_observer_sees_applied_cells() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();
        let snapshot = store.take_mutable_snapshot();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = store.register_apply_observer({
            let seen = seen.clone();
            move |changes, _| seen.lock().push(changes.ids().collect::<Vec<_>>())
        });

        cell.set_untracked(&snapshot, 1).unwrap();
        snapshot.apply().unwrap().check().unwrap();
        assert_eq!(*seen.lock(), vec![vec![cell.id()]]);

        handle.dispose();
        handle.dispose();
        store
            .with_mutable_snapshot(|s| cell.set_untracked(s, 2).unwrap())
            .unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_send_apply_notifications_publishes_global_writes() {
        let (store, global) = setup();
        let seen = Arc::new(AtomicUsize::new(0));
        let _handle = store.register_apply_observer({
            let seen = seen.clone();
            move |changes, _| {
                seen.fetch_add(changes.len(), Ordering::SeqCst);
            }
        });

        let cell = StateCell::new(&global, 0).unwrap();
        cell.set_untracked(&global, 1).unwrap();
        assert!(global.has_pending_changes());

        assert!(store.send_apply_notifications());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!store.send_apply_notifications());
        assert!(!global.has_pending_changes());
    }

    #[test]
    fn test_global_write_observer() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let writes = Arc::new(AtomicUsize::new(0));
        let handle = store.register_global_write_observer({
            let writes = writes.clone();
            move |_| {
                writes.fetch_add(1, Ordering::SeqCst);
            }
        });

        cell.set_untracked(&global, 1).unwrap();
        // Writes inside other snapshots are not global writes.
        store
            .with_mutable_snapshot(|s| cell.set_untracked(s, 2).unwrap())
            .unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        handle.dispose();
        cell.set_untracked(&global, 3).unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_stack_reports_reads_and_writes() {
        let (_store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let reads = Rc::new(RefCell::new(Vec::new()));
        let writes = Rc::new(RefCell::new(Vec::new()));
        let mut observers = ObserverStack::new();
        observers.with_observer(
            {
                let reads = reads.clone();
                move |s: &StateRef| reads.borrow_mut().push(s.cell_id())
            },
            {
                let writes = writes.clone();
                move |s: &StateRef| writes.borrow_mut().push(s.cell_id())
            },
            |obs| {
                let value = cell.get(&global, obs).unwrap();
                cell.set(&global, obs, value + 1).unwrap();
                // Equivalent value, not a write.
                cell.set(&global, obs, value + 1).unwrap();
            },
        );

        assert_eq!(*reads.borrow(), vec![cell.id()]);
        assert_eq!(*writes.borrow(), vec![cell.id()]);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_nested_observers_run_innermost_first() {
        let (_store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let order = Rc::new(RefCell::new(Vec::new()));
        let mut observers = ObserverStack::new();
        observers.with_read_observer(
            {
                let order = order.clone();
                move |_: &StateRef| order.borrow_mut().push("outer")
            },
            |obs| {
                obs.with_read_observer(
                    {
                        let order = order.clone();
                        move |_: &StateRef| order.borrow_mut().push("inner")
                    },
                    |obs| {
                        assert_eq!(obs.depth(), 2);
                        cell.get(&global, obs).unwrap();
                    },
                );
            },
        );
        assert_eq!(*order.borrow(), vec!["inner", "outer"]);
    }

    #[test]
    fn test_records_are_pruned_once_unpinned() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();
        store.send_apply_notifications();

        let pinned = store.take_snapshot();
        for i in 1..=5 {
            cell.set_untracked(&global, i).unwrap();
            store.send_apply_notifications();
        }
        assert!(cell.record_count() > 2);
        assert_eq!(cell.get_untracked(&pinned).unwrap(), 0);

        pinned.dispose();
        for i in 6..=10 {
            cell.set_untracked(&global, i).unwrap();
            store.send_apply_notifications();
        }
        assert!(cell.record_count() <= 2);
        assert_eq!(cell.get_untracked(&global).unwrap(), 10);
    }

    #[test]
    fn test_policies_decide_what_is_a_change() {
        let (store, global) = setup();
        let structural = StateCell::new(&global, 1).unwrap();
        let never = StateCell::with_policy(&global, 1, NeverEqual).unwrap();
        let shared = Arc::new(String::from("a"));
        let referential =
            StateCell::with_policy(&global, shared.clone(), ReferentialEquality).unwrap();

        let snapshot = store.take_mutable_snapshot();
        structural.set_untracked(&snapshot, 1).unwrap();
        referential.set_untracked(&snapshot, shared.clone()).unwrap();
        assert!(!snapshot.has_pending_changes());

        referential
            .set_untracked(&snapshot, Arc::new(String::from("a")))
            .unwrap();
        never.set_untracked(&snapshot, 1).unwrap();
        let mut modified = snapshot.modified_cells();
        modified.sort();
        let mut expected = vec![referential.id(), never.id()];
        expected.sort();
        assert_eq!(modified, expected);
        snapshot.dispose();
    }

    #[test]
    fn test_derived_state_caches_until_dependency_changes() {
        let (_store, global) = setup();
        let cell = StateCell::new(&global, 1).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let doubled = DerivedState::new({
            let cell = cell.clone();
            let runs = runs.clone();
            move |snapshot: &Snapshot, obs: &mut ObserverStack| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(cell.get(snapshot, obs)? * 2)
            }
        });

        let mut observers = ObserverStack::new();
        assert_eq!(doubled.get(&global, &mut observers).unwrap(), 2);
        assert_eq!(doubled.get(&global, &mut observers).unwrap(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(doubled.dependencies(), vec![cell.id()]);

        cell.set_untracked(&global, 5).unwrap();
        assert_eq!(doubled.get(&global, &mut observers).unwrap(), 10);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        doubled.invalidate();
        assert_eq!(doubled.get(&global, &mut observers).unwrap(), 10);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_derived_state_forwards_reads_on_cache_hit() {
        let (_store, global) = setup();
        let cell = StateCell::new(&global, 1).unwrap();
        let doubled = DerivedState::new({
            let cell = cell.clone();
            move |snapshot: &Snapshot, obs: &mut ObserverStack| Ok(cell.get(snapshot, obs)? * 2)
        });

        let mut observers = ObserverStack::new();
        doubled.get(&global, &mut observers).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        observers.with_read_observer(
            {
                let seen = seen.clone();
                move |s: &StateRef| seen.borrow_mut().push(s.cell_id())
            },
            |obs| doubled.get(&global, obs).unwrap(),
        );
        assert_eq!(*seen.borrow(), vec![cell.id()]);
    }

    #[test]
    fn test_with_mutable_snapshot_reports_conflicts() {
        let (store, global) = setup();
        let cell = StateCell::new(&global, 0).unwrap();

        let racer = store.take_mutable_snapshot();
        cell.set_untracked(&racer, 1).unwrap();
        let result = store.with_mutable_snapshot(|s| {
            cell.set_untracked(s, 2).unwrap();
            racer.apply().unwrap().check().unwrap();
        });
        assert!(matches!(result, Err(StateError::ApplyConflict { .. })));
        assert_eq!(cell.get_untracked(&global).unwrap(), 1);
    }

    #[test]
    fn test_open_snapshot_count_returns_to_baseline() {
        let (store, _global) = setup();
        let baseline = store.open_snapshot_count();

        let root = store.take_mutable_snapshot();
        let nested = root.take_nested_mutable_snapshot().unwrap();
        assert!(store.open_snapshot_count() > baseline);
        nested.dispose();
        root.dispose();
        assert_eq!(store.open_snapshot_count(), baseline);

        {
            let _dropped = store.take_snapshot();
        }
        assert_eq!(store.open_snapshot_count(), baseline);
    }

    #[test]
    fn test_open_snapshot_with_parent_nests() {
        let (store, global) = setup();
        let root = store.open_snapshot(true, Some(&global)).unwrap();
        assert_eq!(root.kind(), SnapshotKind::Mutable);
        let nested = store.open_snapshot(false, Some(&root)).unwrap();
        assert_eq!(nested.kind(), SnapshotKind::NestedReadOnly);
        assert!(nested.parent().unwrap().is_same(&root));
    }
}
