//! # Display Frame Ring
//!
//! The cube shows one layer per tick. A frame is shown for
//! `LAYER_COUNT × FRAME_REPEAT` ticks, then the display moves on to the next
//! frame of the ring, unless that frame is the one still being drawn.
//!
//! ```text
//!   ring:  [ shown │ ready │ ready │ edited │ free │ free │ … ]
//!            ▲                       ▲
//!         current                  edited
//! ```
//!
//! The drawing task owns `edited` until it asks for the next frame, which
//! publishes the finished one. When the ring is full the task waits on
//! `WAIT_DISPLAY` and is woken each time the display moves on.

use crate::config::{FRAME_COUNT, FRAME_REPEAT, FRAME_SIZE, LAYER_COUNT};

/// One cube image: 8 layers of 8 rows, bit `x` of a row byte is one voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame([u8; FRAME_SIZE]);

impl Frame {
    pub const EMPTY: Self = Self([0; FRAME_SIZE]);

    pub fn clear(&mut self) {
        self.0 = [0; FRAME_SIZE];
    }

    pub fn fill(&mut self, on: bool) {
        self.0 = [if on { 0xFF } else { 0x00 }; FRAME_SIZE];
    }

    /// Coordinates are taken modulo 8.
    pub fn set(&mut self, x: u8, y: u8, z: u8, on: bool) {
        let row = &mut self.0[Self::row_index(y, z)];
        let mask = 1 << (x & 7);
        if on {
            *row |= mask;
        } else {
            *row &= !mask;
        }
    }

    pub fn get(&self, x: u8, y: u8, z: u8) -> bool {
        self.0[Self::row_index(y, z)] & (1 << (x & 7)) != 0
    }

    /// Rows of layer `z`.
    pub fn layer(&self, z: u8) -> [u8; 8] {
        let start = usize::from(z & 7) * 8;
        let mut rows = [0u8; 8];
        rows.copy_from_slice(&self.0[start..start + 8]);
        rows
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; FRAME_SIZE] {
        &mut self.0
    }

    fn row_index(y: u8, z: u8) -> usize {
        usize::from(z & 7) * 8 + usize::from(y & 7)
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// How a newly acquired frame starts out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameInit {
    /// Whatever the ring slot last held.
    AsIs,
    /// All voxels off.
    Clear,
    /// A copy of the frame just published.
    Copy,
}

/// What a refresh step put on the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Refresh {
    /// Layer index and its rows, when the display is enabled.
    pub layer: Option<(u8, [u8; 8])>,
    /// The display moved on to a new frame.
    pub advanced: bool,
}

pub struct Display {
    frames: [Frame; FRAME_COUNT],
    current: usize,
    edited: usize,
    layer: u8,
    repeat: u8,
    enabled: bool,
}

const fn next(index: usize) -> usize {
    (index + 1) % FRAME_COUNT
}

impl Display {
    pub const fn new() -> Self {
        Self {
            frames: [Frame::EMPTY; FRAME_COUNT],
            current: 0,
            edited: 1,
            layer: 0,
            repeat: 0,
            enabled: false,
        }
    }

    pub fn enable(&mut self) {
        self.layer = 0;
        self.repeat = 0;
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Frames that can still be acquired without waiting.
    pub fn free_frames(&self) -> usize {
        (self.current + FRAME_COUNT - self.edited) % FRAME_COUNT - 1
    }

    /// Publish the edited frame and acquire the next one. `None` when the
    /// ring is full.
    pub fn advance(&mut self, init: FrameInit) -> Option<usize> {
        let candidate = next(self.edited);
        if candidate == self.current {
            return None;
        }
        match init {
            FrameInit::AsIs => {}
            FrameInit::Clear => self.frames[candidate].clear(),
            FrameInit::Copy => self.frames[candidate] = self.frames[self.edited],
        }
        self.edited = candidate;
        Some(candidate)
    }

    pub fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    pub fn frame_mut(&mut self, index: usize) -> &mut Frame {
        &mut self.frames[index]
    }

    /// Frame currently on the cube.
    pub fn shown(&self) -> &Frame {
        &self.frames[self.current]
    }

    /// One tick of the multiplexed display.
    pub fn refresh(&mut self) -> Refresh {
        if !self.enabled {
            return Refresh {
                layer: None,
                advanced: false,
            };
        }

        let layer = self.layer;
        let rows = self.frames[self.current].layer(layer);

        let mut advanced = false;
        self.layer += 1;
        if usize::from(self.layer) == LAYER_COUNT {
            self.layer = 0;
            self.repeat += 1;
            if self.repeat >= FRAME_REPEAT {
                self.repeat = 0;
                let candidate = next(self.current);
                if candidate != self.edited {
                    self.current = candidate;
                    advanced = true;
                }
            }
        }

        Refresh {
            layer: Some((layer, rows)),
            advanced,
        }
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}
