use std::collections::hash_map::Entry;

use crate::types::HashMap;

const SINGLE_WILDCARD: &str = "+";
const MULTI_WILDCARD: &str = "#";

/// Trie of topic filters, one node per topic level.
///
/// Branches are keyed by the raw level text; a literal level can never be `+` or `#`,
/// so wildcards share the map without ambiguity. Callers insert validated filters only.
#[derive(Debug)]
pub struct TopicTree<V> {
    value: Option<V>,
    branches: HashMap<String, TopicTree<V>>,
}

impl<V> Default for TopicTree<V> {
    fn default() -> Self {
        Self { value: None, branches: HashMap::default() }
    }
}

impl<V> TopicTree<V> {
    /// Stores `value` at `filter`, returning the previous value.
    pub fn insert(&mut self, filter: &str, value: V) -> Option<V> {
        let mut node = self;
        for level in filter.split('/') {
            node = node.branches.entry(level.to_owned()).or_default();
        }
        node.value.replace(value)
    }

    /// Removes the value at `filter`, pruning branches left empty.
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels = filter.split('/').collect::<Vec<_>>();
        self.remove_levels(&levels)
    }

    fn remove_levels(&mut self, levels: &[&str]) -> Option<V> {
        let Some((head, rest)) = levels.split_first() else {
            return self.value.take();
        };
        let Entry::Occupied(mut child) = self.branches.entry((*head).to_owned()) else {
            return None;
        };
        let removed = child.get_mut().remove_levels(rest);
        if child.get().is_empty() {
            child.remove();
        }
        removed
    }

    pub fn get(&self, filter: &str) -> Option<&V> {
        let mut node = self;
        for level in filter.split('/') {
            node = node.branches.get(level)?;
        }
        node.value.as_ref()
    }

    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = self;
        for level in filter.split('/') {
            node = node.branches.get_mut(level)?;
        }
        node.value.as_mut()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.branches.is_empty()
    }

    /// Values of every filter matching the topic name `name`.
    pub fn matches(&self, name: &str) -> Vec<&V> {
        let levels = name.split('/').collect::<Vec<_>>();
        let dollar = name.starts_with('$');
        let mut out = Vec::new();
        self.collect(&levels, dollar, &mut out);
        out
    }

    fn collect<'a>(&'a self, levels: &[&str], dollar_root: bool, out: &mut Vec<&'a V>) {
        let Some((head, rest)) = levels.split_first() else {
            if let Some(v) = self.value.as_ref() {
                out.push(v);
            }
            // "a/#" also matches "a"
            if let Some(v) = self.branches.get(MULTI_WILDCARD).and_then(|b| b.value.as_ref()) {
                out.push(v);
            }
            return;
        };

        if !dollar_root {
            if let Some(v) = self.branches.get(MULTI_WILDCARD).and_then(|b| b.value.as_ref()) {
                out.push(v);
            }
            if let Some(b) = self.branches.get(SINGLE_WILDCARD) {
                b.collect(rest, false, out);
            }
        }
        if let Some(b) = self.branches.get(*head) {
            b.collect(rest, false, out);
        }
    }

    /// Values stored under topic names matched by the topic filter `filter`.
    ///
    /// This is the reverse lookup of [`TopicTree::matches`], used when the tree holds
    /// names (retained messages) instead of filters.
    pub fn matches_filter(&self, filter: &str) -> Vec<&V> {
        let levels = filter.split('/').collect::<Vec<_>>();
        let mut out = Vec::new();
        self.collect_names(&levels, true, &mut out);
        out
    }

    fn collect_names<'a>(&'a self, levels: &[&str], root: bool, out: &mut Vec<&'a V>) {
        let Some((head, rest)) = levels.split_first() else {
            if let Some(v) = self.value.as_ref() {
                out.push(v);
            }
            return;
        };
        match *head {
            MULTI_WILDCARD => {
                if let Some(v) = self.value.as_ref() {
                    out.push(v);
                }
                for (level, b) in self.branches.iter() {
                    if root && level.starts_with('$') {
                        continue;
                    }
                    b.collect_all(out);
                }
            }
            SINGLE_WILDCARD => {
                for (level, b) in self.branches.iter() {
                    if root && level.starts_with('$') {
                        continue;
                    }
                    b.collect_names(rest, false, out);
                }
            }
            level => {
                if let Some(b) = self.branches.get(level) {
                    b.collect_names(rest, false, out);
                }
            }
        }
    }

    fn collect_all<'a>(&'a self, out: &mut Vec<&'a V>) {
        if let Some(v) = self.value.as_ref() {
            out.push(v);
        }
        for b in self.branches.values() {
            b.collect_all(out);
        }
    }

    /// Every stored value.
    pub fn values(&self) -> Vec<&V> {
        let mut out = Vec::new();
        self.collect_all(&mut out);
        out
    }

    /// Keeps only the values for which `f` returns true, pruning emptied branches.
    /// Returns the number of removed values.
    pub fn retain<F>(&mut self, f: &mut F) -> usize
    where
        F: FnMut(&V) -> bool,
    {
        let mut removed = 0;
        if self.value.as_ref().map(|v| !f(v)).unwrap_or(false) {
            self.value = None;
            removed += 1;
        }
        self.branches.retain(|_, b| {
            removed += b.retain(&mut *f);
            !b.is_empty()
        });
        removed
    }

    /// Number of stored values.
    pub fn values_size(&self) -> usize {
        self.branches.values().map(|b| b.values_size()).sum::<usize>() + usize::from(self.value.is_some())
    }

    /// Number of nodes below the root.
    pub fn nodes_size(&self) -> usize {
        self.branches.values().map(|b| b.nodes_size() + 1).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(filters: &[&'static str]) -> TopicTree<&'static str> {
        let mut t = TopicTree::default();
        for f in filters {
            t.insert(f, *f);
        }
        t
    }

    fn sorted(mut v: Vec<&&'static str>) -> Vec<&'static str> {
        v.sort();
        v.into_iter().copied().collect()
    }

    #[test]
    fn literal_and_wildcards() {
        let t = tree(&["sensors/+/temp", "sensors/#", "sensors/room1/temp", "#", "other/+"]);
        assert_eq!(
            sorted(t.matches("sensors/room1/temp")),
            vec!["#", "sensors/#", "sensors/+/temp", "sensors/room1/temp"]
        );
        assert_eq!(sorted(t.matches("sensors")), vec!["#", "sensors/#"]);
        assert_eq!(sorted(t.matches("other")), vec!["#"]);
        assert_eq!(sorted(t.matches("other/x")), vec!["#", "other/+"]);
        assert_eq!(sorted(t.matches("other/x/y")), vec!["#"]);
    }

    #[test]
    fn dollar_topics() {
        let t = tree(&["#", "+/info", "$SYS/#", "$SYS/+"]);
        assert_eq!(sorted(t.matches("$SYS/info")), vec!["$SYS/#", "$SYS/+"]);
        assert_eq!(sorted(t.matches("SYS/info")), vec!["#", "+/info"]);
    }

    #[test]
    fn blank_levels() {
        let t = tree(&["/+", "+/+", "+"]);
        assert_eq!(sorted(t.matches("/finance")), vec!["+/+", "/+"]);
        assert_eq!(sorted(t.matches("finance")), vec!["+"]);
    }

    #[test]
    fn remove_prunes() {
        let mut t = tree(&["a/b/c", "a/b", "x/#"]);
        assert_eq!(t.values_size(), 3);
        assert_eq!(t.nodes_size(), 5);
        assert_eq!(t.remove("a/b/c"), Some("a/b/c"));
        assert_eq!(t.remove("a/b/c"), None);
        assert_eq!(t.nodes_size(), 4);
        assert_eq!(t.get("a/b"), Some(&"a/b"));
        assert_eq!(t.remove("a/b"), Some("a/b"));
        assert_eq!(t.remove("x/#"), Some("x/#"));
        assert!(t.is_empty());
        assert_eq!(t.nodes_size(), 0);
    }

    #[test]
    fn filter_lookup_over_names() {
        let t = tree(&["a", "a/b", "a/b/c", "x/b", "$SYS/up", "/a"]);
        assert_eq!(sorted(t.matches_filter("a/#")), vec!["a", "a/b", "a/b/c"]);
        assert_eq!(sorted(t.matches_filter("+/b")), vec!["a/b", "x/b"]);
        assert_eq!(sorted(t.matches_filter("#")), vec!["/a", "a", "a/b", "a/b/c", "x/b"]);
        assert_eq!(sorted(t.matches_filter("$SYS/#")), vec!["$SYS/up"]);
        assert_eq!(sorted(t.matches_filter("+/a")), vec!["/a"]);
        assert_eq!(sorted(t.matches_filter("a/b")), vec!["a/b"]);
        assert!(t.matches_filter("a/b/c/d").is_empty());
        assert_eq!(t.values().len(), 6);
    }

    #[test]
    fn retain_prunes() {
        let mut t = tree(&["a/b/c", "a/b", "x/y"]);
        assert_eq!(t.retain(&mut |v| !v.starts_with("a/")), 2);
        assert_eq!(sorted(t.values()), vec!["x/y"]);
        assert_eq!(t.nodes_size(), 2);
        assert_eq!(t.retain(&mut |_| false), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn matches_agree_with_topic_matching() {
        use crate::topic::Topic;
        let filters = ["a/+/c", "a/#", "+/b/+", "#", "a/b", "$x/#", "+", "/#", "a//c"];
        let names = ["a/b/c", "a/b", "a", "$x/a", "b/b/b", "/a", "a//c", "$x"];
        let t = tree(&filters);
        for name in names {
            let mut expect = filters
                .iter()
                .filter(|f| f.parse::<Topic>().unwrap().matches_str(name))
                .copied()
                .collect::<Vec<_>>();
            expect.sort();
            assert_eq!(sorted(t.matches(name)), expect, "name {}", name);
        }
    }
}
