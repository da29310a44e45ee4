use pkg_constants::quota::ROOT_QUOTA_NAME;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

use crate::error::{QuotaError, Result};
use crate::quota_info::QuotaInfo;

/// Parent/child structure around a [`QuotaInfo`].
///
/// The node holds the record by reference and the parent by name; it never
/// owns resource numbers, so the engine always reads and writes the
/// authoritative `QuotaInfo`.
#[derive(Debug, Clone)]
pub struct QuotaTopoNode {
    name: String,
    quota_info: Arc<QuotaInfo>,
    parent: Option<String>,
    children: BTreeMap<String, Arc<QuotaInfo>>,
}

impl QuotaTopoNode {
    pub fn new(quota_info: Arc<QuotaInfo>) -> Self {
        Self {
            name: quota_info.name().to_string(),
            quota_info,
            parent: None,
            children: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quota_info(&self) -> &Arc<QuotaInfo> {
        &self.quota_info
    }

    /// Parent group name, `None` for top-level groups.
    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn add_child_group_quota_info(&mut self, child: &QuotaTopoNode) {
        self.children
            .insert(child.name.clone(), Arc::clone(&child.quota_info));
    }

    pub fn remove_child_group_quota_info(&mut self, name: &str) -> Option<Arc<QuotaInfo>> {
        self.children.remove(name)
    }

    /// Copy of the child map; mutating it does not affect the topology.
    pub fn child_group_quota_infos(&self) -> BTreeMap<String, Arc<QuotaInfo>> {
        self.children.clone()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }
}

/// The quota tree, as a name-indexed node table.
#[derive(Debug, Clone, Default)]
pub struct QuotaTopology {
    nodes: HashMap<String, QuotaTopoNode>,
    roots: BTreeSet<String>,
}

fn is_top_level(parent_name: &str) -> bool {
    parent_name.is_empty() || parent_name == ROOT_QUOTA_NAME
}

impl QuotaTopology {
    /// Assemble the tree from a flat set of records.
    ///
    /// Rejects children whose parent is absent or not a parent group, and
    /// groups that cannot be reached from a top-level group (cycles).
    pub fn build(infos: impl IntoIterator<Item = Arc<QuotaInfo>>) -> Result<Self> {
        let mut nodes: HashMap<String, QuotaTopoNode> = HashMap::new();
        let mut declared: HashMap<String, (String, bool)> = HashMap::new();
        for info in infos {
            // One lock per record, released before the next.
            let (parent_name, is_parent) = {
                let state = info.lock();
                (state.parent_name.clone(), state.is_parent)
            };
            declared.insert(info.name().to_string(), (parent_name, is_parent));
            nodes.insert(info.name().to_string(), QuotaTopoNode::new(info));
        }

        let mut names: Vec<&String> = declared.keys().collect();
        names.sort();

        let mut roots = BTreeSet::new();
        let mut edges: Vec<(String, String)> = Vec::new();
        for name in names {
            let (parent_name, _) = &declared[name];
            if is_top_level(parent_name) {
                roots.insert(name.clone());
                continue;
            }
            match declared.get(parent_name) {
                None => {
                    return Err(QuotaError::ParentNotFound {
                        quota: name.clone(),
                        parent: parent_name.clone(),
                    });
                }
                Some((_, false)) => {
                    return Err(QuotaError::ParentNotParentGroup {
                        quota: name.clone(),
                        parent: parent_name.clone(),
                    });
                }
                Some((_, true)) => edges.push((parent_name.clone(), name.clone())),
            }
        }

        let mut topology = QuotaTopology { nodes, roots };
        for (parent, child) in edges {
            topology.link(&parent, &child);
        }

        let reachable = topology.top_down_order().len();
        if reachable != topology.nodes.len() {
            let reached: BTreeSet<String> = topology.top_down_order().into_iter().collect();
            let mut stranded: Vec<&String> = topology
                .nodes
                .keys()
                .filter(|n| !reached.contains(*n))
                .collect();
            stranded.sort();
            let quota = stranded
                .first()
                .map(|s| s.to_string())
                .unwrap_or_default();
            warn!("Rejected quota topology: '{}' is part of a parent cycle", quota);
            return Err(QuotaError::Cycle { quota });
        }
        Ok(topology)
    }

    fn link(&mut self, parent: &str, child: &str) {
        let Some(child_node) = self.nodes.get_mut(child) else {
            return;
        };
        child_node.parent = Some(parent.to_string());
        let child_node = child_node.clone();
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.add_child_group_quota_info(&child_node);
        }
    }

    /// Move `name` under `new_parent` (`None` for top level).
    pub fn reparent(&mut self, name: &str, new_parent: Option<&str>) -> Result<()> {
        let old_parent = match self.nodes.get(name) {
            Some(node) => node.parent.clone(),
            None => return Err(QuotaError::QuotaNotFound(name.to_string())),
        };
        if let Some(parent) = new_parent {
            match self.nodes.get(parent) {
                None => {
                    return Err(QuotaError::ParentNotFound {
                        quota: name.to_string(),
                        parent: parent.to_string(),
                    });
                }
                Some(node) if !node.quota_info.is_parent() => {
                    return Err(QuotaError::ParentNotParentGroup {
                        quota: name.to_string(),
                        parent: parent.to_string(),
                    });
                }
                Some(_) => {}
            }
            if parent == name || self.is_ancestor(name, parent) {
                return Err(QuotaError::Cycle {
                    quota: name.to_string(),
                });
            }
        }

        match &old_parent {
            Some(old) => {
                if let Some(node) = self.nodes.get_mut(old) {
                    node.remove_child_group_quota_info(name);
                }
            }
            None => {
                self.roots.remove(name);
            }
        }
        match new_parent {
            Some(parent) => self.link(parent, name),
            None => {
                if let Some(node) = self.nodes.get_mut(name) {
                    node.parent = None;
                }
                self.roots.insert(name.to_string());
            }
        }
        Ok(())
    }

    /// True if `ancestor` is on the parent chain of `name`.
    fn is_ancestor(&self, ancestor: &str, name: &str) -> bool {
        let mut current = self.nodes.get(name).and_then(|n| n.parent.as_deref());
        let mut hops = 0;
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.nodes.len() {
                return true;
            }
            current = self.nodes.get(parent).and_then(|n| n.parent.as_deref());
        }
        false
    }

    pub fn node(&self, name: &str) -> Option<&QuotaTopoNode> {
        self.nodes.get(name)
    }

    /// Top-level group names, sorted.
    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.roots.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Breadth-first order from the top-level groups; every parent precedes
    /// its children. Siblings are visited by name.
    pub fn top_down_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue: VecDeque<&str> = self.roots.iter().map(|s| s.as_str()).collect();
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());
            if let Some(node) = self.nodes.get(name) {
                queue.extend(node.children.keys().map(|s| s.as_str()));
            }
        }
        order
    }
}
