//! Reads of the host's native structures needed to build event snapshots.

use crate::dispatch::{ConnState, KamikazeOwner};
use crate::error::{Error, Result};
use crate::layout::HostAbi;
use crate::memory::ReadMemory;

/// Client slots and game entities as laid out by one host build.
pub struct NativeView<'a, R> {
    memory: &'a R,
    abi: &'a HostAbi,
    module_base: usize,
}

impl<'a, R: ReadMemory> NativeView<'a, R> {
    pub fn new(memory: &'a R, abi: &'a HostAbi, module_base: usize) -> Self {
        Self {
            memory,
            abi,
            module_base,
        }
    }

    /// Slot number of the `client_t` at `client`.
    pub fn client_id(&self, client: usize) -> Result<i32> {
        let clients = self.memory.read_ptr(self.abi.clients as usize)?;
        let limit = Some(self.abi.max_clients as usize);
        self.index_of(client, clients, self.abi.client_size, limit, "client")
    }

    pub fn client_state(&self, client: usize) -> Result<Option<ConnState>> {
        let raw = self.memory.read_i32(field(client, self.abi.client_state))?;
        Ok(ConnState::from_repr(raw))
    }

    pub fn client_has_entity(&self, client: usize) -> Result<bool> {
        let entity = self.memory.read_ptr(field(client, self.abi.client_gentity))?;
        Ok(entity != 0)
    }

    /// Index of the `gentity_t` at `entity` in the module's entity array.
    pub fn entity_id(&self, entity: usize) -> Result<i32> {
        let entities = self.module_base.wrapping_add(self.abi.entities as usize);
        self.index_of(entity, entities, self.abi.gentity_size, None, "entity")
    }

    /// Who triggered the kamikaze carried by `entity`: its own client when
    /// activated from the inventory, else the owner of the activator (the
    /// carrier's dead body).
    pub fn kamikaze_owner(&self, entity: usize) -> Result<KamikazeOwner> {
        let client = self.memory.read_ptr(field(entity, self.abi.gentity_client))?;
        if client != 0 {
            let client_id = self
                .memory
                .read_i32(field(client, self.abi.gclient_client_num))?;
            return Ok(KamikazeOwner {
                client_id: Some(client_id),
                used_on_demand: true,
            });
        }

        let activator = self
            .memory
            .read_ptr(field(entity, self.abi.gentity_activator))?;
        let client_id = if activator != 0 {
            Some(
                self.memory
                    .read_i32(field(activator, self.abi.gentity_owner_num))?,
            )
        } else {
            None
        };
        Ok(KamikazeOwner {
            client_id,
            used_on_demand: false,
        })
    }

    fn index_of(
        &self,
        address: usize,
        base: usize,
        stride: u64,
        limit: Option<usize>,
        what: &str,
    ) -> Result<i32> {
        let stride = stride as usize;
        let invalid = |message: String| Error::MemoryReadFailed { address, message };

        if stride == 0 {
            return Err(invalid(format!("{what} size is unset")));
        }
        let offset = address
            .checked_sub(base)
            .ok_or_else(|| invalid(format!("{what} lies before its array at {base:#x}")))?;
        if offset % stride != 0 {
            return Err(invalid(format!("{what} is not aligned to its array")));
        }

        let index = offset / stride;
        if limit.is_some_and(|limit| index >= limit) {
            return Err(invalid(format!("{what} slot {index} out of range")));
        }
        i32::try_from(index).map_err(|_| invalid(format!("{what} index {index} overflows")))
    }
}

fn field(base: usize, offset: u64) -> usize {
    base.wrapping_add(offset as usize)
}
