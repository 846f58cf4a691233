//! The netdev/vport collaborator (spec.md §6: `netdev_ports_get`,
//! `netdev_vport_cast`). Real drivers live behind the NIC vendor layer,
//! explicitly out of scope (§1); this module only carries the bits the
//! classifier and composition engine need to decide *which* netdev a port
//! resolves to and whether it owns a [`CompositionAux`](crate::aux::CompositionAux).

use std::sync::Arc;

use crate::aux::CompositionAux;

pub type PortId = u32;

/// The netdev kinds the classifier and composition engine distinguish.
/// Vendor-specific encapsulation types beyond vxlan are not modeled; the
/// spec only singles out vxlan (§4.2 rule 3/5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetdevKind {
    Physical,
    /// A "tap" netdev: not offloadable as an `OUTPUT` target (§4.2 rule 1).
    Tap,
    Vxlan,
    /// A tunnel vport of a kind other than vxlan.
    OtherVport,
}

pub trait Netdev: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn kind(&self) -> NetdevKind;

    fn is_tap(&self) -> bool {
        matches!(self.kind(), NetdevKind::Tap)
    }

    fn is_tunnel_vport(&self) -> bool {
        matches!(self.kind(), NetdevKind::Vxlan | NetdevKind::OtherVport)
    }

    /// `vport.offload_aux`: present once a tunnel vport has had its
    /// composition table plumbed (spec.md §3, CompositionAux lifecycle).
    fn offload_aux(&self) -> Option<Arc<CompositionAux>> {
        None
    }
}

/// `netdev_ports_get` / `netdev_vport_cast`.
pub trait NetdevProvider: Send + Sync {
    fn port_to_netdev(&self, port: PortId) -> Option<Arc<dyn Netdev>>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug)]
    struct FakeNetdev {
        name: String,
        kind: NetdevKind,
        aux: Mutex<Option<Arc<CompositionAux>>>,
    }

    impl Netdev for FakeNetdev {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> NetdevKind {
            self.kind
        }

        fn offload_aux(&self) -> Option<Arc<CompositionAux>> {
            self.aux.lock().unwrap().clone()
        }
    }

    /// An in-memory port table for tests: the `netdev_ports_get` collaborator.
    #[derive(Default)]
    pub struct FakePorts {
        by_port: Mutex<HashMap<PortId, Arc<FakeNetdev>>>,
        next_port: Mutex<PortId>,
    }

    impl FakePorts {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                by_port: Mutex::new(HashMap::new()),
                next_port: Mutex::new(1),
            })
        }

        fn add(&self, name: &str, kind: NetdevKind) -> PortId {
            let mut next = self.next_port.lock().unwrap();
            let port = *next;
            *next += 1;
            self.by_port.lock().unwrap().insert(
                port,
                Arc::new(FakeNetdev {
                    name: name.to_owned(),
                    kind,
                    aux: Mutex::new(None),
                }),
            );
            port
        }

        pub fn add_physical(&self, name: &str) -> PortId {
            self.add(name, NetdevKind::Physical)
        }

        pub fn add_tap(&self, name: &str) -> PortId {
            self.add(name, NetdevKind::Tap)
        }

        /// Add a vxlan vport and give it a composition table.
        pub fn add_vxlan(&self, name: &str) -> PortId {
            let port = self.add(name, NetdevKind::Vxlan);
            let netdev = self.by_port.lock().unwrap().get(&port).unwrap().clone();
            *netdev.aux.lock().unwrap() = Some(Arc::new(CompositionAux::new()));
            port
        }

        pub fn get(&self, port: PortId) -> Option<Arc<dyn Netdev>> {
            self.by_port
                .lock()
                .unwrap()
                .get(&port)
                .map(|n| n.clone() as Arc<dyn Netdev>)
        }

        pub fn aux_of(&self, port: PortId) -> Option<Arc<CompositionAux>> {
            self.by_port
                .lock()
                .unwrap()
                .get(&port)
                .and_then(|n| n.offload_aux())
        }
    }

    impl NetdevProvider for FakePorts {
        fn port_to_netdev(&self, port: PortId) -> Option<Arc<dyn Netdev>> {
            self.get(port)
        }
    }
}
