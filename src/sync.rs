//! Hook invoked at primary file rotation boundaries
//!
//! Loggers of a multi-device array align their rotations through this
//! hook. The default does nothing.

use log::debug;

/// Called by the logger right after the primary file of a rotation is
/// closed and before the next one is opened.
pub trait RotationSync {
    /// Returns true to request that the rotation be deferred. The logger
    /// currently always rotates.
    fn on_rotation_boundary(&mut self) -> bool;
}

/// Stand-alone logger without peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSync;

impl RotationSync for NoSync {
    fn on_rotation_boundary(&mut self) -> bool {
        false
    }
}

impl<F: FnMut() -> bool> RotationSync for F {
    fn on_rotation_boundary(&mut self) -> bool {
        self()
    }
}

/// Signals exchanged over the CAN bus of a logger array.
///
/// The frames on the wire are up to the implementation.
pub trait CanBus {
    /// Identifier of this device on the bus.
    fn id(&self) -> u8;

    /// Tell the master that this device finished its file.
    fn send_end_file(&mut self);

    /// Tell all devices to start their next file.
    fn send_start(&mut self);

    /// Block until the master's start signal arrives.
    fn receive_start(&mut self);
}

/// Rotation hook aligning file boundaries over a CAN bus.
pub struct CanSync<B: CanBus> {
    bus: B,
    master: bool,
}

impl<B: CanBus> CanSync<B> {
    pub const fn new(bus: B, master: bool) -> Self {
        Self { bus, master }
    }

    pub const fn master(&self) -> bool {
        self.master
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B: CanBus> RotationSync for CanSync<B> {
    fn on_rotation_boundary(&mut self) -> bool {
        if self.master {
            debug!("CAN: send start");
            self.bus.send_start();
        } else {
            self.bus.send_end_file();
            if self.bus.id() > 0 {
                debug!("CAN: device {} waits for start", self.bus.id());
                self.bus.receive_start();
            }
        }
        false
    }
}
