//! Node tree shared by every session of an in-memory ensemble.

use std::collections::{BTreeMap, HashSet};

use registry_core::{
    Acl, SessionId, Stat, StoreError, WatchEvent, WatchEventKind,
    path::{self, ROOT},
    traits::CreateOptions,
};
use tokio::sync::mpsc;

/// Identity of the session issuing a request.
#[derive(Debug, Clone)]
pub(super) struct Caller {
    pub id: SessionId,
    pub identity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeAcl {
    Open,
    Owner(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    stat: Stat,
    acl: NodeAcl,
}

struct Watcher {
    session: SessionId,
    root: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

/// The replicated tree. Every mutation is applied and notified under the
/// ensemble lock, so watchers observe changes in commit order.
pub(super) struct Tree {
    nodes: BTreeMap<String, Node>,
    zxid: i64,
    watchers: Vec<Watcher>,
    sessions: HashSet<SessionId>,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT.to_string(),
            Node {
                data: Vec::new(),
                stat: Stat::default(),
                acl: NodeAcl::Open,
            },
        );
        Self {
            nodes,
            zxid: 0,
            watchers: Vec::new(),
            sessions: HashSet::new(),
        }
    }
}

impl Tree {
    pub fn open_session(&mut self, id: SessionId) {
        self.sessions.insert(id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop the session's watchers and remove its ephemeral nodes.
    pub fn close_session(&mut self, id: SessionId) {
        if !self.sessions.remove(&id) {
            return;
        }
        self.watchers.retain(|w| w.session != id);

        let owned: Vec<String> = self
            .nodes
            .iter()
            .rev()
            .filter(|(_, node)| node.stat.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.remove_node(&path);
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes.get(path).map(|n| n.data.clone())
    }

    pub fn create(
        &mut self,
        caller: &Caller,
        path: &str,
        data: &[u8],
        options: &CreateOptions,
    ) -> Result<String, StoreError> {
        path::validate(path)?;
        if path == ROOT {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        let acl = resolve_acl(caller, path, &options.acl)?;
        let parent = path::parent(path).unwrap_or(ROOT).to_string();

        if !self.nodes.contains_key(&parent) {
            if !options.create_parents {
                return Err(StoreError::NoNode(parent));
            }
            self.create_parents(caller, &parent, &acl)?;
        }

        let parent_node = self.writable_parent(caller, &parent, path)?;
        let target = if options.mode.is_sequential() {
            format!("{path}{:010}", parent_node.stat.cversion)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&target) {
            return Err(StoreError::NodeExists(target));
        }

        let owner = options.mode.is_ephemeral().then_some(caller.id);
        self.insert_node(&target, data.to_vec(), acl, owner);
        Ok(target)
    }

    pub fn get_data(&self, caller: &Caller, path: &str) -> Result<(Vec<u8>, Stat), StoreError> {
        let node = self.node(path)?;
        check_access(caller, path, node)?;
        Ok((node.data.clone(), node.stat.clone()))
    }

    pub fn set_data(
        &mut self,
        caller: &Caller,
        path: &str,
        data: &[u8],
    ) -> Result<Stat, StoreError> {
        check_access(caller, path, self.node(path)?)?;
        self.zxid += 1;
        let zxid = self.zxid;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.data_length = node.data.len();
        let stat = node.stat.clone();
        self.notify(WatchEventKind::NodeDataChanged, path);
        Ok(stat)
    }

    pub fn delete(
        &mut self,
        caller: &Caller,
        path: &str,
        recursive: bool,
    ) -> Result<(), StoreError> {
        path::validate(path)?;
        if path == ROOT {
            return Err(StoreError::BadArguments("cannot delete the root node".to_string()));
        }
        let node = self.node(path)?;
        if node.stat.num_children > 0 && !recursive {
            return Err(StoreError::NotEmpty(path.to_string()));
        }

        // Descendants sort after their ancestors, so reverse order removes
        // children before parents.
        let prefix = format!("{path}/");
        let mut doomed: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p.clone())
            .collect();
        doomed.reverse();
        doomed.push(path.to_string());
        for each in &doomed {
            let parent = path::parent(each).unwrap_or(ROOT);
            check_access(caller, parent, self.node(parent)?)?;
        }
        for each in &doomed {
            self.remove_node(each);
        }
        Ok(())
    }

    pub fn exists(&self, path: &str) -> Result<Option<Stat>, StoreError> {
        path::validate(path)?;
        Ok(self.nodes.get(path).map(|n| n.stat.clone()))
    }

    pub fn get_children(&self, caller: &Caller, path: &str) -> Result<Vec<String>, StoreError> {
        let node = self.node(path)?;
        check_access(caller, path, node)?;
        Ok(self.child_names(path))
    }

    pub fn add_watcher(
        &mut self,
        session: SessionId,
        root: &str,
        tx: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<(), StoreError> {
        path::validate(root)?;
        self.watchers.push(Watcher {
            session,
            root: root.to_string(),
            tx,
        });
        Ok(())
    }

    fn node(&self, path: &str) -> Result<&Node, StoreError> {
        path::validate(path)?;
        self.nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    fn writable_parent(
        &self,
        caller: &Caller,
        parent: &str,
        child: &str,
    ) -> Result<&Node, StoreError> {
        let node = self.node(parent)?;
        if node.stat.ephemeral_owner.is_some() {
            return Err(StoreError::NoChildrenForEphemerals(child.to_string()));
        }
        check_access(caller, parent, node)?;
        Ok(node)
    }

    fn create_parents(
        &mut self,
        caller: &Caller,
        missing: &str,
        acl: &NodeAcl,
    ) -> Result<(), StoreError> {
        let mut chain = vec![missing.to_string()];
        let mut cursor = missing;
        while let Some(parent) = path::parent(cursor) {
            if self.nodes.contains_key(parent) {
                break;
            }
            chain.push(parent.to_string());
            cursor = parent;
        }
        for each in chain.into_iter().rev() {
            let parent = path::parent(&each).unwrap_or(ROOT);
            self.writable_parent(caller, parent, &each)?;
            self.insert_node(&each, Vec::new(), acl.clone(), None);
        }
        Ok(())
    }

    fn insert_node(&mut self, path: &str, data: Vec<u8>, acl: NodeAcl, owner: Option<SessionId>) {
        self.zxid += 1;
        let stat = Stat {
            czxid: self.zxid,
            mzxid: self.zxid,
            ephemeral_owner: owner,
            data_length: data.len(),
            ..Stat::default()
        };
        self.nodes.insert(path.to_string(), Node { data, stat, acl });
        if let Some(parent) = path::parent(path).and_then(|p| self.nodes.get_mut(p)) {
            parent.stat.cversion += 1;
            parent.stat.num_children += 1;
        }
        self.notify(WatchEventKind::NodeCreated, path);
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        self.zxid += 1;
        if let Some(parent) = path::parent(path).and_then(|p| self.nodes.get_mut(p)) {
            parent.stat.cversion += 1;
            parent.stat.num_children = parent.stat.num_children.saturating_sub(1);
        }
        self.notify(WatchEventKind::NodeDeleted, path);
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == ROOT {
            ROOT.to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn notify(&mut self, kind: WatchEventKind, path: &str) {
        self.watchers.retain(|w| {
            if !path::is_within(&w.root, path) {
                return true;
            }
            w.tx
                .send(WatchEvent {
                    kind,
                    path: path.to_string(),
                })
                .is_ok()
        });
    }
}

fn resolve_acl(caller: &Caller, path: &str, acl: &[Acl]) -> Result<NodeAcl, StoreError> {
    if acl.is_empty() {
        return Err(StoreError::InvalidAcl(path.to_string()));
    }
    if acl.contains(&Acl::CreatorAll) {
        return caller
            .identity
            .clone()
            .map(NodeAcl::Owner)
            .ok_or_else(|| StoreError::InvalidAcl(path.to_string()));
    }
    Ok(NodeAcl::Open)
}

fn check_access(caller: &Caller, path: &str, node: &Node) -> Result<(), StoreError> {
    match &node.acl {
        NodeAcl::Open => Ok(()),
        NodeAcl::Owner(owner) if caller.identity.as_deref() == Some(owner.as_str()) => Ok(()),
        NodeAcl::Owner(_) => Err(StoreError::NoAuth(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use registry_core::CreateMode;
    use uuid::Uuid;

    use super::*;

    fn caller() -> Caller {
        Caller {
            id: Uuid::new_v4(),
            identity: None,
        }
    }

    fn open(mode: CreateMode) -> CreateOptions {
        CreateOptions::new(mode, vec![Acl::AnyoneAll])
    }

    #[test]
    fn test_create_requires_parent() {
        let mut tree = Tree::default();
        let c = caller();
        let err = tree
            .create(&c, "/a/b", b"x", &open(CreateMode::Persistent))
            .unwrap_err();
        assert!(matches!(err, StoreError::NoNode(p) if p == "/a"));

        let created = tree
            .create(&c, "/a/b", b"x", &open(CreateMode::Persistent).creating_parents())
            .unwrap();
        assert_eq!(created, "/a/b");
        assert!(tree.contains("/a"));
        assert_eq!(tree.data("/a/b"), Some(b"x".to_vec()));
    }

    #[test]
    fn test_sequential_suffix_uses_parent_cversion() {
        let mut tree = Tree::default();
        let c = caller();
        let options = open(CreateMode::PersistentSequential).creating_parents();
        let first = tree.create(&c, "/jobs/job-", b"", &options).unwrap();
        let second = tree.create(&c, "/jobs/job-", b"", &options).unwrap();
        assert_eq!(first, "/jobs/job-0000000000");
        assert_eq!(second, "/jobs/job-0000000001");
    }

    #[test]
    fn test_delete_non_recursive_refuses_children() {
        let mut tree = Tree::default();
        let c = caller();
        tree.create(&c, "/a/b/c", b"", &open(CreateMode::Persistent).creating_parents())
            .unwrap();
        tree.create(&c, "/a/b-x", b"", &open(CreateMode::Persistent)).unwrap();
        assert!(matches!(tree.delete(&c, "/a/b", false), Err(StoreError::NotEmpty(_))));

        tree.delete(&c, "/a/b", true).unwrap();
        assert!(!tree.contains("/a/b"));
        assert!(!tree.contains("/a/b/c"));
        assert!(tree.contains("/a/b-x"));
        assert_eq!(tree.child_names("/a"), vec!["b-x"]);
    }

    #[test]
    fn test_ephemeral_parent_refuses_children() {
        let mut tree = Tree::default();
        let c = caller();
        tree.create(&c, "/e", b"", &open(CreateMode::Ephemeral)).unwrap();
        let err = tree
            .create(&c, "/e/child", b"", &open(CreateMode::Persistent))
            .unwrap_err();
        assert!(matches!(err, StoreError::NoChildrenForEphemerals(_)));
    }

    #[test]
    fn test_close_session_removes_ephemerals() {
        let mut tree = Tree::default();
        let c = caller();
        tree.open_session(c.id);
        tree.create(&c, "/svc/a", b"", &open(CreateMode::Ephemeral).creating_parents())
            .unwrap();
        tree.close_session(c.id);
        assert!(!tree.contains("/svc/a"));
        assert!(tree.contains("/svc"));
        assert_eq!(tree.session_count(), 0);
    }

    #[test]
    fn test_creator_acl() {
        let mut tree = Tree::default();
        let owner = Caller {
            id: Uuid::new_v4(),
            identity: Some("user:digest".to_string()),
        };
        let stranger = caller();
        let options = CreateOptions::new(CreateMode::Persistent, vec![Acl::CreatorAll]);

        assert!(matches!(
            tree.create(&stranger, "/secret", b"", &options),
            Err(StoreError::InvalidAcl(_))
        ));
        tree.create(&owner, "/secret", b"v", &options).unwrap();
        assert!(tree.get_data(&owner, "/secret").is_ok());
        assert!(matches!(tree.get_data(&stranger, "/secret"), Err(StoreError::NoAuth(_))));
        assert!(tree.exists("/secret").unwrap().is_some());
    }

    #[test]
    fn test_watchers_filter_by_subtree() {
        let mut tree = Tree::default();
        let c = caller();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tree.add_watcher(c.id, "/a", tx).unwrap();

        tree.create(&c, "/ab", b"", &open(CreateMode::Persistent)).unwrap();
        tree.create(&c, "/a", b"", &open(CreateMode::Persistent)).unwrap();
        tree.set_data(&c, "/a", b"v").unwrap();

        assert_eq!(rx.try_recv().unwrap().kind, WatchEventKind::NodeCreated);
        assert_eq!(rx.try_recv().unwrap().kind, WatchEventKind::NodeDataChanged);
        assert!(rx.try_recv().is_err());
    }
}
