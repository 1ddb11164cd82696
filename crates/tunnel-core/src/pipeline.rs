//! The preset contract and the ordered chain that drives it.
//!
//! The source protocol's presets communicate via a three-way callback
//! (`next`, `broadcast`, `fail`) captured over relay state. This is
//! re-expressed as a plain tagged enum returned from each operation — no
//! closures, no captured relay state. `CONNECT_TO_DST`'s completion callback
//! becomes an explicit `on_connected` method the relay invokes once the
//! outbound is open.

use bytes::Bytes;
use tunnel_proto::Address;

/// Result of driving one chunk through one preset operation.
pub enum PresetOutcome {
    /// Chunk continues to the next preset (or out to the transport if this
    /// was the last one in the chain).
    Continue(Bytes),
    /// The preset consumed the chunk and has nothing to emit yet (e.g. still
    /// buffering a fragmented handshake header).
    Swallow,
    /// The preset parsed a destination and wants the relay to open (or
    /// reuse) the outbound endpoint. The relay must call `on_connected` on
    /// this same preset once the outbound is ready.
    ConnectToDst(Address),
    /// The preset rejected the chunk; the relay should close (or redirect,
    /// per `CoreConfig::redirect`) instead of continuing.
    Fail(String),
}

/// A stateful, per-direction byte transformer. One instance serves both the
/// forward and backward direction of a single relay; unused operations
/// default to identity so presets without address/auth concerns (future
/// additions) need only implement the ones they change.
pub trait Preset: Send {
    /// Wrap a chunk before it leaves the client toward the server.
    fn client_out(&mut self, chunk: Bytes) -> PresetOutcome {
        PresetOutcome::Continue(chunk)
    }

    /// Unwrap a chunk arriving at the server from the client.
    fn server_in(&mut self, chunk: Bytes) -> PresetOutcome {
        PresetOutcome::Continue(chunk)
    }

    /// Wrap a chunk before it leaves the server toward the client.
    fn server_out(&mut self, chunk: Bytes) -> PresetOutcome {
        PresetOutcome::Continue(chunk)
    }

    /// Unwrap a chunk arriving at the client from the server.
    fn client_in(&mut self, chunk: Bytes) -> PresetOutcome {
        PresetOutcome::Continue(chunk)
    }

    /// Called once after a `ConnectToDst` outcome's outbound is open. Returns
    /// any application bytes the preset buffered while waiting, to be
    /// flushed to the outbound immediately.
    fn on_connected(&mut self) -> Bytes {
        Bytes::new()
    }

    /// Has this preset's handshake completed? Used only for diagnostics and
    /// the "handshake transitions false→true exactly once" invariant in
    /// tests; presets with no handshake concept report `true` always.
    fn handshake_done(&self) -> bool {
        true
    }

    /// Called on inbound EOF so a preset can flush buffered bytes or, if its
    /// handshake never completed, surface that as a failure instead of
    /// letting the relay close silently. The default turns an incomplete
    /// handshake into `Fail` and a completed (or handshake-less) preset into
    /// an empty `Continue`; presets with their own teardown bytes to flush
    /// override this.
    fn drain(&mut self) -> PresetOutcome {
        if self.handshake_done() {
            PresetOutcome::Continue(Bytes::new())
        } else {
            PresetOutcome::Fail("connection closed before handshake completed".to_owned())
        }
    }
}

/// Which side of the connection a pipeline instance is driving. The same
/// preset instances serve both directions of one relay; this only selects
/// which pair of operations `forward`/`backward` invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This pipeline sits on the client: forward = `client_out`, backward =
    /// `client_in`.
    Client,
    /// This pipeline sits on the server: forward = `server_in`, backward =
    /// `server_out`.
    Server,
}

/// An ordered chain of presets, driven in order `P1..Pn` on the forward
/// direction and `Pn..P1` on the backward direction.
pub struct Pipeline {
    role: Role,
    presets: Vec<Box<dyn Preset>>,
}

impl Pipeline {
    pub fn new(role: Role, presets: Vec<Box<dyn Preset>>) -> Self {
        Pipeline { role, presets }
    }

    /// Drive `chunk` through the forward-direction operation of every
    /// preset in order. Stops early on `Swallow`, `ConnectToDst`, or `Fail`.
    pub fn forward(&mut self, chunk: Bytes) -> PresetOutcome {
        let mut current = chunk;
        for preset in self.presets.iter_mut() {
            let outcome = match self.role {
                Role::Client => preset.client_out(current),
                Role::Server => preset.server_in(current),
            };
            match outcome {
                PresetOutcome::Continue(next) => current = next,
                other => return other,
            }
        }
        PresetOutcome::Continue(current)
    }

    /// Drive `chunk` through the backward-direction operation of every
    /// preset in reverse order.
    pub fn backward(&mut self, chunk: Bytes) -> PresetOutcome {
        let mut current = chunk;
        for preset in self.presets.iter_mut().rev() {
            let outcome = match self.role {
                Role::Client => preset.client_in(current),
                Role::Server => preset.server_out(current),
            };
            match outcome {
                PresetOutcome::Continue(next) => current = next,
                other => return other,
            }
        }
        PresetOutcome::Continue(current)
    }

    /// Invoke `on_connected` on every preset, concatenating whatever they
    /// release. Only the preset that emitted `ConnectToDst` is expected to
    /// have buffered bytes; the rest return empty.
    pub fn on_connected(&mut self) -> Bytes {
        let mut out = Vec::new();
        for preset in self.presets.iter_mut() {
            out.extend_from_slice(&preset.on_connected());
        }
        Bytes::from(out)
    }

    /// Invoke `drain` on every preset in forward order, on teardown (inbound
    /// EOF). Short-circuits on the first non-`Continue` outcome the same way
    /// `forward`/`backward` do, so a still-mid-handshake preset's `Fail`
    /// reaches the relay's existing `Fail` handling (including redirect).
    pub fn drain(&mut self) -> PresetOutcome {
        let mut out = Vec::new();
        for preset in self.presets.iter_mut() {
            match preset.drain() {
                PresetOutcome::Continue(bytes) => out.extend_from_slice(&bytes),
                other => return other,
            }
        }
        PresetOutcome::Continue(Bytes::from(out))
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;
    impl Preset for Upper {
        fn client_out(&mut self, chunk: Bytes) -> PresetOutcome {
            PresetOutcome::Continue(Bytes::from(chunk.to_ascii_uppercase()))
        }
    }

    struct Reject;
    impl Preset for Reject {
        fn client_out(&mut self, _chunk: Bytes) -> PresetOutcome {
            PresetOutcome::Fail("rejected".to_owned())
        }
    }

    #[test]
    fn forward_chains_presets_in_order() {
        let mut pipeline = Pipeline::new(Role::Client, vec![Box::new(Upper)]);
        match pipeline.forward(Bytes::from_static(b"abc")) {
            PresetOutcome::Continue(out) => assert_eq!(&out[..], b"ABC"),
            _ => panic!("expected continue"),
        }
    }

    #[test]
    fn forward_short_circuits_on_fail() {
        let mut pipeline = Pipeline::new(Role::Client, vec![Box::new(Reject), Box::new(Upper)]);
        match pipeline.forward(Bytes::from_static(b"abc")) {
            PresetOutcome::Fail(reason) => assert_eq!(reason, "rejected"),
            _ => panic!("expected fail"),
        }
    }

    struct NeverDone;
    impl Preset for NeverDone {
        fn handshake_done(&self) -> bool {
            false
        }
    }

    #[test]
    fn drain_fails_when_handshake_never_completed() {
        let mut pipeline = Pipeline::new(Role::Client, vec![Box::new(NeverDone)]);
        match pipeline.drain() {
            PresetOutcome::Fail(_) => {}
            _ => panic!("expected fail"),
        }
    }

    #[test]
    fn drain_continues_when_handshake_already_done() {
        let mut pipeline = Pipeline::new(Role::Client, vec![Box::new(Upper)]);
        match pipeline.drain() {
            PresetOutcome::Continue(bytes) => assert!(bytes.is_empty()),
            _ => panic!("expected continue"),
        }
    }
}
