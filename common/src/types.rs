//! Common Types for the 5G MAC scheduler
//!
//! Defines fundamental types shared by the scheduler core and the gNB driver

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};

/// Number of system frames before the frame number wraps
pub const NUM_FRAMES: u16 = 1024;

/// Number of OFDM symbols in a slot with normal cyclic prefix
pub const SYMBOLS_PER_SLOT: u8 = 14;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// SI-RNTI used for system information broadcast
    pub const SI: Self = Self(0xFFFF);
    /// P-RNTI used for paging
    pub const P: Self = Self(0xFFFE);

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u16);

/// Physical Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pci(pub u16);

impl Pci {
    /// Maximum valid PCI value (0-1007)
    pub const MAX: u16 = 1007;

    /// Create a new PCI with validation
    pub fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Numerology index (mu)
    pub fn numerology(&self) -> u8 {
        match self {
            SubcarrierSpacing::Scs15 => 0,
            SubcarrierSpacing::Scs30 => 1,
            SubcarrierSpacing::Scs60 => 2,
            SubcarrierSpacing::Scs120 => 3,
            SubcarrierSpacing::Scs240 => 4,
        }
    }

    /// Number of slots per 10 ms frame
    pub fn slots_per_frame(&self) -> u16 {
        10 << self.numerology()
    }

    /// Slot duration in microseconds (240 kHz is rounded down)
    pub fn slot_duration_us(&self) -> u32 {
        1000 >> self.numerology()
    }
}

/// Cyclic prefix type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclicPrefix {
    Normal,
    Extended,
}

impl CyclicPrefix {
    /// OFDM symbols per slot for this prefix
    pub fn symbols_per_slot(&self) -> u8 {
        match self {
            CyclicPrefix::Normal => SYMBOLS_PER_SLOT,
            CyclicPrefix::Extended => 12,
        }
    }
}

impl Default for CyclicPrefix {
    fn default() -> Self {
        CyclicPrefix::Normal
    }
}

/// Bandwidth values in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    /// 5 MHz
    Bw5,
    /// 10 MHz
    Bw10,
    /// 15 MHz
    Bw15,
    /// 20 MHz
    Bw20,
    /// 25 MHz
    Bw25,
    /// 30 MHz
    Bw30,
    /// 40 MHz
    Bw40,
    /// 50 MHz
    Bw50,
    /// 60 MHz
    Bw60,
    /// 80 MHz
    Bw80,
    /// 100 MHz
    Bw100,
}

impl Bandwidth {
    /// Map a channel bandwidth in MHz to the enum
    pub fn from_mhz(mhz: u32) -> Option<Self> {
        let bw = match mhz {
            5 => Bandwidth::Bw5,
            10 => Bandwidth::Bw10,
            15 => Bandwidth::Bw15,
            20 => Bandwidth::Bw20,
            25 => Bandwidth::Bw25,
            30 => Bandwidth::Bw30,
            40 => Bandwidth::Bw40,
            50 => Bandwidth::Bw50,
            60 => Bandwidth::Bw60,
            80 => Bandwidth::Bw80,
            100 => Bandwidth::Bw100,
            _ => return None,
        };
        Some(bw)
    }

    /// Get bandwidth in Hz
    pub fn as_hz(&self) -> u32 {
        match self {
            Bandwidth::Bw5 => 5_000_000,
            Bandwidth::Bw10 => 10_000_000,
            Bandwidth::Bw15 => 15_000_000,
            Bandwidth::Bw20 => 20_000_000,
            Bandwidth::Bw25 => 25_000_000,
            Bandwidth::Bw30 => 30_000_000,
            Bandwidth::Bw40 => 40_000_000,
            Bandwidth::Bw50 => 50_000_000,
            Bandwidth::Bw60 => 60_000_000,
            Bandwidth::Bw80 => 80_000_000,
            Bandwidth::Bw100 => 100_000_000,
        }
    }
}

/// Transmission direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Downlink,
    Uplink,
}

/// A (frame, slot) point in time.
///
/// Frames wrap at [`NUM_FRAMES`]; arithmetic needs the slots-per-frame of the
/// numerology in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SlotPoint {
    /// System frame number (0-1023)
    pub frame: u16,
    /// Slot within the frame
    pub slot: u16,
}

impl SlotPoint {
    pub fn new(frame: u16, slot: u16) -> Self {
        Self { frame: frame % NUM_FRAMES, slot }
    }

    /// Slot count since frame 0 of the current hyper-period
    pub fn count(&self, slots_per_frame: u16) -> u32 {
        self.frame as u32 * slots_per_frame as u32 + self.slot as u32
    }

    /// Build a slot point from a slot count, wrapping at the hyper-period
    pub fn from_count(count: u32, slots_per_frame: u16) -> Self {
        let period = NUM_FRAMES as u32 * slots_per_frame as u32;
        let count = count % period;
        Self {
            frame: (count / slots_per_frame as u32) as u16,
            slot: (count % slots_per_frame as u32) as u16,
        }
    }

    /// The slot point `slots` slots later
    pub fn advance(&self, slots: u32, slots_per_frame: u16) -> Self {
        Self::from_count(self.count(slots_per_frame) + slots, slots_per_frame)
    }

    /// Slots elapsed from `earlier` to `self`, modulo the hyper-period
    pub fn slots_since(&self, earlier: SlotPoint, slots_per_frame: u16) -> u32 {
        let period = NUM_FRAMES as u32 * slots_per_frame as u32;
        (self.count(slots_per_frame) + period - earlier.count(slots_per_frame) % period) % period
    }
}

/// Frames elapsed from `earlier` to `now`, modulo 1024
pub fn frame_diff(now: u16, earlier: u16) -> u16 {
    (now % NUM_FRAMES + NUM_FRAMES - earlier % NUM_FRAMES) % NUM_FRAMES
}
