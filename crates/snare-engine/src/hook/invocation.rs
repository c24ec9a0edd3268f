use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{ArgumentSpec, HookDescriptor, Interpretation};
use crate::address::{Address, ResolvedAddress};
use crate::backend::CallFrame;
use crate::channel::{ChannelClosed, Message, Sender};
use crate::error::FrameError;

/// Argument captured on interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argument {
    /// Layout entry this argument was captured for.
    spec: ArgumentSpec,

    /// Full register or stack slot value.
    raw: u64,
}

impl Argument {
    /// Returns the index of the argument.
    pub const fn index(&self) -> usize {
        self.spec.index
    }

    /// Returns how the argument is interpreted.
    pub const fn interpretation(&self) -> Interpretation {
        self.spec.interpretation
    }

    /// Returns the value truncated to the width of its interpretation.
    pub const fn value(&self) -> u64 {
        self.spec.interpretation.narrow(self.raw)
    }

    /// Returns the value sign-extended (or zero-extended) to 64 bits.
    pub const fn as_i64(&self) -> i64 {
        self.spec.interpretation.widen(self.raw)
    }

    /// Returns the value as a boolean.
    pub const fn as_bool(&self) -> bool {
        self.value() != 0
    }

    /// Returns the value as an address within the target.
    pub const fn as_address(&self) -> Address {
        Address::new(self.value())
    }
}

/// Call intercepted by a hook.
///
/// Built for every call, and dropped once the callback returns.
#[derive(Debug, Clone)]
pub struct InterceptionEvent {
    pub(crate) descriptor: Arc<HookDescriptor>,
    pub(crate) address: ResolvedAddress,
    pub(crate) thread_id: u64,
    pub(crate) arguments: Vec<Argument>,
    pub(crate) timestamp: SystemTime,
}

impl InterceptionEvent {
    /// Returns the descriptor of the hook which intercepted the call.
    pub fn descriptor(&self) -> &HookDescriptor {
        &self.descriptor
    }

    /// Returns the absolute address of the hook.
    pub const fn address(&self) -> ResolvedAddress {
        self.address
    }

    /// Returns the ID of the calling thread.
    pub const fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Returns the captured arguments, in layout order.
    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    /// Returns the interception time.
    pub const fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Converts this event into a channel message.
    pub fn to_message(&self) -> Message {
        let timestamp_us = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        Message::Event {
            hook: self.descriptor.label(),
            thread_id: self.thread_id,
            arguments: self.arguments.iter().map(Argument::value).collect(),
            timestamp_us,
        }
    }
}

/// View over an intercepted call, handed to the hook callback.
///
/// The calling thread stays suspended for as long as the invocation lives,
/// so callbacks should return quickly.
pub struct Invocation<'a> {
    event: InterceptionEvent,
    frame: &'a mut dyn CallFrame,
    notifier: Option<&'a Sender<Message>>,
    dirty: Vec<usize>,
}

impl<'a> Invocation<'a> {
    pub(crate) fn capture(
        descriptor: Arc<HookDescriptor>,
        address: ResolvedAddress,
        frame: &'a mut dyn CallFrame,
        notifier: Option<&'a Sender<Message>>,
    ) -> Result<Self, FrameError> {
        let arguments = descriptor
            .layout()
            .iter()
            .map(|&spec| {
                frame
                    .argument(spec.index)
                    .map(|raw| Argument { spec, raw })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let event = InterceptionEvent {
            descriptor,
            address,
            thread_id: frame.thread_id(),
            arguments,
            timestamp: SystemTime::now(),
        };

        Ok(Self {
            event,
            frame,
            notifier,
            dirty: Vec::new(),
        })
    }

    /// Returns the intercepted call.
    pub fn event(&self) -> &InterceptionEvent {
        &self.event
    }

    /// Returns the captured arguments, in layout order.
    pub fn arguments(&self) -> &[Argument] {
        &self.event.arguments
    }

    /// Returns the captured argument with the given index.
    pub fn argument(&self, index: usize) -> Option<&Argument> {
        self.event.arguments.iter().find(|arg| arg.index() == index)
    }

    /// Replaces the value of a captured argument.
    ///
    /// The value is narrowed to the argument's width, and written back to
    /// the calling thread when the callback returns. Bits above that width
    /// are preserved.
    pub fn set_argument(&mut self, index: usize, value: u64) -> Result<(), FrameError> {
        let (position, arg) = self
            .event
            .arguments
            .iter_mut()
            .enumerate()
            .find(|(_, arg)| arg.index() == index)
            .ok_or(FrameError::ArgumentUnavailable(index))?;

        let interpretation = arg.interpretation();
        let mask = interpretation.narrow(u64::MAX);
        arg.raw = (arg.raw & !mask) | interpretation.narrow(value);

        if !self.dirty.contains(&position) {
            self.dirty.push(position);
        }

        Ok(())
    }

    /// Reads `len` bytes of the target's memory.
    pub fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>, FrameError> {
        let mut buf = vec![0; len];
        self.frame.read_memory(addr, &mut buf)?;
        Ok(buf)
    }

    /// Writes bytes into the target's memory.
    ///
    /// Exactly `data.len()` bytes are written.
    pub fn write_bytes(&mut self, addr: Address, data: &[u8]) -> Result<(), FrameError> {
        self.frame.write_memory(addr, data)
    }

    /// Reads a little-endian `u8` from the target's memory.
    pub fn read_u8(&self, addr: Address) -> Result<u8, FrameError> {
        self.read_array(addr).map(u8::from_le_bytes)
    }

    /// Reads a little-endian `u16` from the target's memory.
    pub fn read_u16(&self, addr: Address) -> Result<u16, FrameError> {
        self.read_array(addr).map(u16::from_le_bytes)
    }

    /// Reads a little-endian `u32` from the target's memory.
    pub fn read_u32(&self, addr: Address) -> Result<u32, FrameError> {
        self.read_array(addr).map(u32::from_le_bytes)
    }

    /// Reads a little-endian `u64` from the target's memory.
    pub fn read_u64(&self, addr: Address) -> Result<u64, FrameError> {
        self.read_array(addr).map(u64::from_le_bytes)
    }

    /// Reads a pointer from the target's memory.
    pub fn read_pointer(&self, addr: Address) -> Result<Address, FrameError> {
        self.read_u64(addr).map(Address::new)
    }

    /// Writes a little-endian `u8` into the target's memory.
    pub fn write_u8(&mut self, addr: Address, value: u8) -> Result<(), FrameError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Writes a little-endian `u16` into the target's memory.
    pub fn write_u16(&mut self, addr: Address, value: u16) -> Result<(), FrameError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Writes a little-endian `u32` into the target's memory.
    pub fn write_u32(&mut self, addr: Address, value: u32) -> Result<(), FrameError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Writes a little-endian `u64` into the target's memory.
    pub fn write_u64(&mut self, addr: Address, value: u64) -> Result<(), FrameError> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Sends a message to the controller.
    pub fn notify(&self, message: Message) -> Result<(), ChannelClosed> {
        self.notifier.ok_or(ChannelClosed)?.send(message)
    }

    /// Sends this call to the controller as a [Message::Event].
    pub fn report(&self) -> Result<(), ChannelClosed> {
        self.notify(self.event.to_message())
    }

    /// Writes the mutated arguments back to the calling thread.
    pub(crate) fn commit(mut self) -> Result<(), FrameError> {
        for position in std::mem::take(&mut self.dirty) {
            let Some(arg) = self.event.arguments.get(position) else {
                continue;
            };

            self.frame.set_argument(arg.index(), arg.raw)?;
        }

        Ok(())
    }

    fn read_array<const N: usize>(&self, addr: Address) -> Result<[u8; N], FrameError> {
        let mut buf = [0; N];
        self.frame.read_memory(addr, &mut buf)?;
        Ok(buf)
    }
}
