//! Dependency-ordered cleanup stack.
//!
//! Nodes register teardown closures together with the handles of entries
//! that must be cleaned up *after* them. On teardown the stack runs each
//! closure exactly once, strictly before every entry it depends on.

use fxhash::{FxHashMap, FxHashSet};

/// Opaque handle identifying a cleanup entry. Usually derived from the
/// owning node so dependencies can be declared in terms of node handles.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CleanupHandle(pub u64);

type CleanupFn = Box<dyn FnOnce() + Send>;

struct CleanupEntry {
    handle: CleanupHandle,
    name: String,
    run: CleanupFn,
    /// Entries that must run after this one.
    depends_on: Vec<CleanupHandle>,
}

#[derive(Default)]
pub struct CleanupStack {
    entries: Vec<CleanupEntry>,
}

impl CleanupStack {
    pub fn new() -> CleanupStack {
        CleanupStack::default()
    }

    /// Register a teardown closure. `depends_on` lists entries that must be
    /// cleaned up after this one (typically the device a resource was
    /// created from).
    pub fn register(
        &mut self,
        handle: CleanupHandle,
        name: impl Into<String>,
        run: impl FnOnce() + Send + 'static,
        depends_on: Vec<CleanupHandle>,
    ) {
        self.entries.push(CleanupEntry {
            handle,
            name: name.into(),
            run: Box::new(run),
            depends_on,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every registered closure in dependency order and erase them.
    /// Each entry runs strictly before the entries it depends on; ties run
    /// in reverse registration order, so the most recently registered
    /// teardown goes first.
    pub fn run_all(&mut self) -> usize {
        let entries = std::mem::take(&mut self.entries);
        if entries.is_empty() {
            return 0;
        }

        // An entry may depend on handles that never registered a closure
        // (external nodes cleaned elsewhere); those edges are dropped.
        let registered: FxHashSet<CleanupHandle> =
            entries.iter().map(|e| e.handle).collect();

        // in_degree counts unresolved predecessors: entry E must run before
        // each D in E.depends_on, so D's degree counts the entries that
        // still have to run first.
        let mut followers: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
        let mut in_degree: Vec<usize> = vec![0; entries.len()];
        let index_of: FxHashMap<CleanupHandle, Vec<usize>> = {
            let mut map: FxHashMap<CleanupHandle, Vec<usize>> = FxHashMap::default();
            for (i, e) in entries.iter().enumerate() {
                map.entry(e.handle).or_default().push(i);
            }
            map
        };

        for (i, entry) in entries.iter().enumerate() {
            for dep in &entry.depends_on {
                if !registered.contains(dep) {
                    continue;
                }
                for &j in &index_of[dep] {
                    in_degree[j] += 1;
                    followers[i].push(j);
                }
            }
        }

        // Popping from the vec's tail yields reverse registration order for
        // ties.
        let mut ready: Vec<usize> = (0..entries.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();

        let mut order = Vec::with_capacity(entries.len());
        while let Some(i) = ready.pop() {
            order.push(i);
            for &j in &followers[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(j);
                }
            }
        }

        if order.len() != entries.len() {
            // Cyclic cleanup dependencies. Run the remainder in reverse
            // registration order rather than leaking them.
            log::error!("cleanup stack: cyclic dependencies, falling back to LIFO for the rest");
            let done: FxHashSet<usize> = order.iter().copied().collect();
            for i in (0..entries.len()).rev() {
                if !done.contains(&i) {
                    order.push(i);
                }
            }
        }

        let count = order.len();
        let mut runs: Vec<Option<(String, CleanupFn)>> = entries
            .into_iter()
            .map(|e| Some((e.name, e.run)))
            .collect();
        for i in order {
            if let Some((name, run)) = runs[i].take() {
                log::debug!("cleanup: {name}");
                run();
            }
        }
        count
    }

    /// Drop all entries without running them.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn entry_runs_before_its_dependencies() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();

        let device = CleanupHandle(1);
        let shader = CleanupHandle(2);

        let o = Arc::clone(&order);
        stack.register(device, "device", move || o.lock().push("device"), vec![]);
        // The shader must be destroyed before the device it was created from.
        let o = Arc::clone(&order);
        stack.register(shader, "shader", move || o.lock().push("shader"), vec![device]);

        assert_eq!(stack.run_all(), 2);
        assert_eq!(*order.lock(), vec!["shader", "device"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn ties_run_in_reverse_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for i in 0..3u64 {
            let o = Arc::clone(&order);
            stack.register(CleanupHandle(i), format!("e{i}"), move || o.lock().push(i), vec![]);
        }
        stack.run_all();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn closures_run_exactly_once() {
        let count = Arc::new(Mutex::new(0));
        let mut stack = CleanupStack::new();
        let c = Arc::clone(&count);
        stack.register(CleanupHandle(1), "once", move || *c.lock() += 1, vec![]);
        stack.run_all();
        stack.run_all();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn unregistered_dependency_is_ignored() {
        let ran = Arc::new(Mutex::new(false));
        let mut stack = CleanupStack::new();
        let r = Arc::clone(&ran);
        stack.register(
            CleanupHandle(1),
            "entry",
            move || *r.lock() = true,
            vec![CleanupHandle(99)],
        );
        assert_eq!(stack.run_all(), 1);
        assert!(*ran.lock());
    }

    #[test]
    fn chain_of_three() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        let a = CleanupHandle(1);
        let b = CleanupHandle(2);
        let c = CleanupHandle(3);

        // a registered first, depends on nothing.
        let o = Arc::clone(&order);
        stack.register(a, "a", move || o.lock().push("a"), vec![]);
        // b must run before a.
        let o = Arc::clone(&order);
        stack.register(b, "b", move || o.lock().push("b"), vec![a]);
        // c must run before b.
        let o = Arc::clone(&order);
        stack.register(c, "c", move || o.lock().push("c"), vec![b]);

        stack.run_all();
        assert_eq!(*order.lock(), vec!["c", "b", "a"]);
    }
}
