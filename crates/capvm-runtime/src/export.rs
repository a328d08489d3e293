//! Export table
//!
//! Script values handed to native code as `O` handles are kept on a
//! doubly linked list that the collector scans as a root. Each node knows
//! where its predecessor's forward link lives, so unlinking is O(1) and
//! never walks the list.
//!
//! Nodes sit in an arena; tokens are sealed over a small backing allocation
//! with a key private to the owning context.

use std::cell::RefCell;
use std::rc::Rc;

use capvm_arch::{AllocError, Allocator, SObj, SealingKey, TokenStore};
use capvm_engine::{RootSource, Value};

/// Bytes of quota charged per exported node.
pub const NODE_SIZE: u32 = 16;

type NodeId = usize;

/// Location of the forward link that points at a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Head,
    Next(NodeId),
}

#[derive(Debug)]
struct Node {
    token: SObj,
    value: Value,
    next: Option<NodeId>,
    prev_next: Link,
}

pub struct ExportTable {
    tokens: TokenStore<NodeId>,
    nodes: Vec<Option<Node>>,
    free_slots: Vec<NodeId>,
    head: Option<NodeId>,
}

impl ExportTable {
    pub fn new(allocator: Allocator) -> Self {
        ExportTable {
            tokens: TokenStore::new(SealingKey::new(), allocator),
            nodes: Vec::new(),
            free_slots: Vec::new(),
            head: None,
        }
    }

    fn link_of(&mut self, link: Link) -> &mut Option<NodeId> {
        match link {
            Link::Head => &mut self.head,
            Link::Next(id) => match self.nodes.get_mut(id).and_then(Option::as_mut) {
                Some(node) => &mut node.next,
                None => &mut self.head,
            },
        }
    }

    /// Roots `value` and returns a token for it.
    pub fn export(&mut self, value: Value) -> Result<SObj, AllocError> {
        let id = self.free_slots.pop().unwrap_or(self.nodes.len());
        let token = match self.tokens.alloc(NODE_SIZE, id) {
            Ok(token) => token,
            Err(err) => {
                if id < self.nodes.len() {
                    self.free_slots.push(id);
                }
                return Err(err);
            }
        };
        let node = Node {
            token,
            value,
            next: self.head,
            prev_next: Link::Head,
        };
        if let Some(old) = self.head {
            if let Some(old) = self.nodes[old].as_mut() {
                old.prev_next = Link::Next(id);
            }
        }
        if id == self.nodes.len() {
            self.nodes.push(Some(node));
        } else {
            self.nodes[id] = Some(node);
        }
        self.head = Some(id);
        log::debug!("exported {:?} as {:?}", value, token);
        Ok(token)
    }

    /// The value behind a live token.
    pub fn resolve(&self, token: SObj) -> Option<Value> {
        let id = *self.tokens.unseal(token)?;
        self.nodes.get(id)?.as_ref().map(|n| n.value)
    }

    pub fn contains(&self, token: SObj) -> bool {
        self.resolve(token).is_some()
    }

    /// Unlinks the node behind `token` and invalidates the token. Returns
    /// the value it kept alive, or `None` (and changes nothing) if the token
    /// is not live in this table.
    pub fn free(&mut self, token: SObj) -> Option<Value> {
        let id = *self.tokens.unseal(token)?;
        let node = self.nodes.get_mut(id)?.take()?;
        if let Some(next) = node.next {
            if let Some(next) = self.nodes[next].as_mut() {
                next.prev_next = node.prev_next;
            }
        }
        *self.link_of(node.prev_next) = node.next;
        self.free_slots.push(id);
        self.tokens.destroy(token);
        log::debug!("freed export {:?}", token);
        Some(node.value)
    }

    /// Frees every node.
    pub fn clear(&mut self) {
        let mut released = 0;
        while let Some(id) = self.head {
            let token = self.nodes[id].as_ref().map(|n| n.token);
            match token.and_then(|t| self.free(t)) {
                Some(_) => released += 1,
                None => {
                    // Unreachable through the public API; drop the chain.
                    self.head = None;
                }
            }
        }
        if released > 0 {
            log::debug!("released {} exported objects", released);
        }
        self.nodes.clear();
        self.free_slots.clear();
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Values in list order, newest first.
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.nodes.get(cursor?)?.as_ref()?;
            cursor = node.next;
            Some(node.value)
        })
    }
}

/// Root source over a shared export table.
pub struct ExportRoots(pub Rc<RefCell<ExportTable>>);

impl RootSource for ExportRoots {
    fn roots(&self, out: &mut Vec<Value>) {
        match self.0.try_borrow() {
            Ok(table) => out.extend(table.iter()),
            Err(_) => log::error!("export table busy during collection"),
        }
    }
}
