//! Rotary encoder abstraction consumed by the flywheel controller.
//!
//! Hardware access lives with the runtime. The controller only needs a signed,
//! monotonically accumulating tick count, optionally reversed in sign.

/// A source of accumulated encoder ticks.
pub trait Encoder {
    /// Current tick count since the encoder was started.
    fn count(&mut self) -> i32;
}

impl<E: Encoder + ?Sized> Encoder for &mut E {
    fn count(&mut self) -> i32 {
        (**self).count()
    }
}

/// Attaches an encoder wired to a pair of digital ports.
pub trait EncoderPorts {
    type Encoder: Encoder;

    /// Start the encoder whose top and bottom wires are on the given ports.
    fn attach(
        &mut self,
        top: u8,
        bottom: u8,
    ) -> Self::Encoder;
}

/// Encoder wrapper that applies the configured direction.
pub struct Oriented<E> {
    encoder: E,
    reverse: bool,
}

impl<E: Encoder> Oriented<E> {
    pub fn new(
        encoder: E,
        reverse: bool,
    ) -> Self {
        Self { encoder, reverse }
    }

    pub fn is_reversed(&self) -> bool {
        self.reverse
    }

    /// Release the underlying encoder.
    pub fn free(self) -> E {
        self.encoder
    }
}

impl<E: Encoder> Encoder for Oriented<E> {
    fn count(&mut self) -> i32 {
        let raw = self.encoder.count();
        if self.reverse {
            raw.wrapping_neg()
        } else {
            raw
        }
    }
}
