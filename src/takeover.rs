//! Acknowledgement tracking for the takeover of a failed registrar's elements.

use std::{collections::BTreeSet, fmt};

use itertools::Itertools;

use crate::{
    element::{RegistrarIdentifier, UNDEFINED_REGISTRAR_IDENTIFIER},
    error::{RegistrarError, Result},
    peer_list::PeerListManagement,
};

/// The peers that still have to acknowledge a takeover.
///
/// Completion is decided by the caller once [`outstanding_acks`](Self::outstanding_acks)
/// reaches zero; expiry is handled by the peer timer of the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TakeoverProcess {
    target: RegistrarIdentifier,
    outstanding: BTreeSet<RegistrarIdentifier>,
}

impl TakeoverProcess {
    /// Snapshots every known peer except the target and the own registrar.
    pub fn new(target: RegistrarIdentifier, peers: &PeerListManagement) -> Result<Self> {
        if target == UNDEFINED_REGISTRAR_IDENTIFIER {
            return Err(RegistrarError::InvalidId);
        }
        if target == peers.own_identifier() {
            return Err(RegistrarError::OwnId);
        }

        let outstanding = peers
            .iter()
            .map(|peer| peer.identifier())
            .filter(|id| {
                *id != target
                    && *id != peers.own_identifier()
                    && *id != UNDEFINED_REGISTRAR_IDENTIFIER
            })
            .collect();
        Ok(TakeoverProcess {
            target,
            outstanding,
        })
    }

    /// The registrar being taken over.
    pub fn target(&self) -> RegistrarIdentifier {
        self.target
    }

    /// Number of acknowledgements still missing.
    pub fn outstanding_acks(&self) -> usize {
        self.outstanding.len()
    }

    /// Peers that have not acknowledged yet.
    pub fn outstanding(&self) -> impl Iterator<Item = RegistrarIdentifier> + '_ {
        self.outstanding.iter().copied()
    }

    /// Returns `true` once every peer has acknowledged.
    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Records an acknowledgement and returns the number still missing.
    ///
    /// Unknown or repeated acknowledgers, and acknowledgements for another target, change
    /// nothing.
    pub fn acknowledge(
        &mut self,
        target: RegistrarIdentifier,
        acknowledger: RegistrarIdentifier,
    ) -> usize {
        if target == self.target {
            self.outstanding.remove(&acknowledger);
        }
        self.outstanding.len()
    }
}

impl fmt::Display for TakeoverProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Takeover of ${:08x}: {} outstanding {{{}}}",
            self.target,
            self.outstanding.len(),
            self.outstanding
                .iter()
                .format_with(", ", |id, f| f(&format_args!("${id:08x}"))),
        )
    }
}
