//! Named, URI-addressed endpoints and the process-wide registry mapping
//! URIs to them.

use abi::config::{ENDPOINT_TABLE_SIZE, ENDPOINT_URI_SIZE, MAX_SIGNALS};
use abi::EndpointHandle;
use heapless::String;

use crate::pool::MessageRef;

/// A named addressable unit owning a signal counter and a "latest
/// published" message slot.
///
/// The signal counter is modeled as "available permits" the way the
/// source's `semaphore_t` is: `signals = MAX_SIGNALS - available`.
/// `has_signals`/`get_signals` read that derived count; `get_signals`
/// resets to full rather than decrementing by the count read, which
/// drops concurrently-arriving signals. This is preserved exactly per
/// the resolved open question in SPEC_FULL.md — signals are advisory,
/// not loss-free.
pub struct Endpoint {
    uri: String<ENDPOINT_URI_SIZE>,
    owner: EndpointHandle,
    generation: u16,
    live: bool,
    available: u8,
    published: Option<MessageRef>,
    /// Second single-message slot used by `post`/`read`, distinct from
    /// `published` so point-to-point delivery never clobbers the
    /// broadcast `publish` value (see SPEC_FULL.md §4.8.1).
    inbox: Option<MessageRef>,
}

impl Endpoint {
    const fn empty() -> Self {
        Endpoint {
            uri: String::new(),
            owner: EndpointHandle::EMPTY,
            generation: 0,
            live: false,
            available: MAX_SIGNALS,
            published: None,
            inbox: None,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn owner(&self) -> EndpointHandle {
        self.owner
    }

    /// Takes a signal if one is available. Returns `false` at
    /// saturation (255 outstanding signals).
    pub fn signal(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    /// Advisory, lock-free read: `true` iff at least one signal is
    /// outstanding.
    pub fn has_signals(&self) -> bool {
        self.available < MAX_SIGNALS
    }

    /// Returns the outstanding signal count and resets the counter to
    /// full. Not atomic with `has_signals`; a signal delivered between
    /// the two calls is lost.
    pub fn get_signals(&mut self) -> u8 {
        let signals = MAX_SIGNALS - self.available;
        if signals > 0 {
            self.available = MAX_SIGNALS;
        }
        signals
    }

    pub fn publish(&mut self, message: MessageRef) {
        self.published = Some(message);
    }

    /// `true` iff a message is published with `id > since`.
    pub fn peek(&self, since: u32) -> bool {
        self.published.as_ref().is_some_and(|m| m.id() > since)
    }

    pub fn pull(&self) -> Option<&MessageRef> {
        self.published.as_ref()
    }

    /// Installs `message` in the inbox iff it is currently empty. Hands
    /// `message` back on failure so the caller can retry the same
    /// handle on the next poll rather than needing a fresh one.
    /// Backing primitive for `post`.
    pub fn try_post(&mut self, message: MessageRef) -> Result<(), MessageRef> {
        if self.inbox.is_some() {
            return Err(message);
        }
        self.inbox = Some(message);
        Ok(())
    }

    /// Takes the inbox message, if any, leaving it empty. Backing
    /// primitive for `read`.
    pub fn take_inbox(&mut self) -> Option<MessageRef> {
        self.inbox.take()
    }
}

/// Process-wide URI -> Endpoint map, protected by a single critical
/// section. A fixed-capacity slab rather than the source's unbounded
/// `std::map`, since this kernel has no heap (see SPEC_FULL.md §4.3).
pub struct EndpointRegistry {
    slots: [Endpoint; ENDPOINT_TABLE_SIZE],
}

impl EndpointRegistry {
    pub const fn new() -> Self {
        EndpointRegistry { slots: [const { Endpoint::empty() }; ENDPOINT_TABLE_SIZE] }
    }

    fn find(&self, uri: &str) -> Option<usize> {
        self.slots.iter().position(|e| e.live && e.uri.as_str() == uri)
    }

    /// Registers a new endpoint under `uri`, owned by `owner`. Returns
    /// [`EndpointHandle::EMPTY`] if `uri` is already registered or the
    /// table is full, matching the source's duplicate-URI and
    /// allocation-refused behavior.
    pub fn create(&mut self, uri: &str, owner: EndpointHandle) -> EndpointHandle {
        if self.find(uri).is_some() {
            return EndpointHandle::EMPTY;
        }
        let Some(index) = self.slots.iter().position(|e| !e.live) else {
            return EndpointHandle::EMPTY;
        };
        let Ok(stored_uri) = String::try_from(uri) else {
            return EndpointHandle::EMPTY;
        };
        let generation = self.slots[index].generation.wrapping_add(1);
        self.slots[index] = Endpoint {
            uri: stored_uri,
            owner,
            generation,
            live: true,
            available: MAX_SIGNALS,
            published: None,
            inbox: None,
        };
        EndpointHandle { index: index as u16, generation }
    }

    /// Looks up a live handle to the endpoint at `uri`.
    pub fn get(&self, uri: &str) -> Option<EndpointHandle> {
        let index = self.find(uri)?;
        Some(EndpointHandle { index: index as u16, generation: self.slots[index].generation })
    }

    /// Removes the endpoint named by `handle`'s URI, if `handle` is
    /// still live (its generation matches the stored slot). Hands back
    /// whatever was published/posted rather than dropping it inline: a
    /// `MessageRef`'s `Drop` re-enters `MessagePool`'s own critical
    /// section, so callers holding the registry's lock must drop the
    /// result only after releasing it.
    pub fn release(&mut self, handle: EndpointHandle) -> (Option<MessageRef>, Option<MessageRef>) {
        if let Some(ep) = self.resolve_mut(handle) {
            ep.live = false;
            ep.uri.clear();
            (ep.published.take(), ep.inbox.take())
        } else {
            (None, None)
        }
    }

    pub fn resolve(&self, handle: EndpointHandle) -> Option<&Endpoint> {
        if handle.is_empty() {
            return None;
        }
        let slot = self.slots.get(handle.index as usize)?;
        (slot.live && slot.generation == handle.generation).then_some(slot)
    }

    pub fn resolve_mut(&mut self, handle: EndpointHandle) -> Option<&mut Endpoint> {
        if handle.is_empty() {
            return None;
        }
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.live && slot.generation == handle.generation {
            Some(slot)
        } else {
            None
        }
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_create_returns_empty_handle() {
        let mut reg = EndpointRegistry::new();
        let first = reg.create("/x", EndpointHandle::EMPTY);
        assert!(!first.is_empty());
        let second = reg.create("/x", EndpointHandle::EMPTY);
        assert!(second.is_empty());
        assert!(reg.get("/x").is_some());
    }

    #[test]
    fn release_then_recreate_reuses_slot_with_new_generation() {
        let mut reg = EndpointRegistry::new();
        let first = reg.create("/x", EndpointHandle::EMPTY);
        reg.release(first);
        assert!(reg.resolve(first).is_none());
        let second = reg.create("/x", EndpointHandle::EMPTY);
        assert!(!second.is_empty());
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
    }

    #[test]
    fn signal_saturates_at_255() {
        let mut ep = Endpoint::empty();
        for _ in 0..255 {
            assert!(ep.signal());
        }
        assert!(!ep.signal());
        assert_eq!(ep.get_signals(), 255);
    }

    #[test]
    fn get_signals_resets_counter() {
        let mut ep = Endpoint::empty();
        ep.signal();
        ep.signal();
        assert_eq!(ep.get_signals(), 2);
        assert!(!ep.has_signals());
        assert_eq!(ep.get_signals(), 0);
    }
}
