//! Software SPI over plain GPIO lines
//!
//! Every edge is a write to the line's value file, so the clock rate is
//! whatever the filesystem round trip allows. Only writes are implemented:
//! the input line is configured but never sampled, and `phase` is stored but
//! does not change the clocking.

use crate::board::PinName;
use crate::error::{GpioError, Result};
use crate::pin::{Direction, PinDevice};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Soft SPI lines and clocking, as read from the daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftSpiConfig {
    pub clock: PinName,
    #[serde(default)]
    pub output: Option<PinName>,
    #[serde(default)]
    pub input: Option<PinName>,
    #[serde(default = "default_polarity")]
    pub polarity: u8,
    #[serde(default)]
    pub phase: u8,
    #[serde(default = "default_word_size")]
    pub word_size: u8,
}

fn default_polarity() -> u8 {
    1
}

fn default_word_size() -> u8 {
    8
}

pub struct SoftSpiBuilder<P: PinDevice> {
    clock: Option<P>,
    output: Option<P>,
    input: Option<P>,
    polarity: u8,
    phase: u8,
    word_size: u8,
}

impl<P: PinDevice> Default for SoftSpiBuilder<P> {
    fn default() -> Self {
        SoftSpiBuilder {
            clock: None,
            output: None,
            input: None,
            polarity: default_polarity(),
            phase: 0,
            word_size: default_word_size(),
        }
    }
}

impl<P: PinDevice> SoftSpiBuilder<P> {
    pub fn clock(mut self, pin: P) -> Self {
        self.clock = Some(pin);
        self
    }

    pub fn output(mut self, pin: P) -> Self {
        self.output = Some(pin);
        self
    }

    pub fn input(mut self, pin: P) -> Self {
        self.input = Some(pin);
        self
    }

    pub fn polarity(mut self, polarity: u8) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn phase(mut self, phase: u8) -> Self {
        self.phase = phase;
        self
    }

    pub fn word_size(mut self, word_size: u8) -> Self {
        self.word_size = word_size;
        self
    }

    /// Validate the lines, export them if needed and drive them all low.
    pub fn build(self) -> Result<SoftSpi<P>> {
        let clock = self
            .clock
            .ok_or_else(|| GpioError::Configuration("clock pin is required".to_string()))?;
        if self.output.is_none() && self.input.is_none() {
            return Err(GpioError::Configuration(
                "at least an input or output pin must be specified".to_string(),
            ));
        }
        if self.polarity > 1 {
            return Err(GpioError::Configuration(
                "polarity must be either 0 or 1".to_string(),
            ));
        }
        if self.phase > 1 {
            return Err(GpioError::Configuration(
                "phase must be either 0 or 1".to_string(),
            ));
        }
        if !(1..=32).contains(&self.word_size) {
            return Err(GpioError::Configuration(format!(
                "word size must be between 1 and 32, got {}",
                self.word_size
            )));
        }

        let spi = SoftSpi {
            clock,
            output: self.output,
            input: self.input,
            polarity: self.polarity,
            phase: self.phase,
            word_size: self.word_size,
        };

        for pin in spi.pins() {
            if !pin.exists() {
                pin.export()?;
            }
        }
        // The input line is driven as an output too, until reads exist.
        for pin in spi.pins() {
            pin.set_direction(Direction::Output)?;
        }
        for pin in spi.pins() {
            pin.set_value(0)?;
        }

        info!(
            "Soft SPI ready: clock={} output={:?} input={:?} polarity={} word_size={}",
            spi.clock.name(),
            spi.output.as_ref().map(|p| p.name()),
            spi.input.as_ref().map(|p| p.name()),
            spi.polarity,
            spi.word_size
        );
        Ok(spi)
    }
}

/// Bit-banged SPI master.
pub struct SoftSpi<P: PinDevice> {
    clock: P,
    output: Option<P>,
    input: Option<P>,
    polarity: u8,
    phase: u8,
    word_size: u8,
}

impl<P: PinDevice> SoftSpi<P> {
    pub fn builder() -> SoftSpiBuilder<P> {
        SoftSpiBuilder::default()
    }

    fn pins(&self) -> impl Iterator<Item = &P> {
        std::iter::once(&self.clock)
            .chain(self.input.as_ref())
            .chain(self.output.as_ref())
    }

    pub fn polarity(&self) -> u8 {
        self.polarity
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }

    pub fn word_size(&self) -> u8 {
        self.word_size
    }

    pub fn max_word(&self) -> u32 {
        ((1u64 << self.word_size) - 1) as u32
    }

    /// Clock `words` out with the default reversed ordering.
    pub fn write(&mut self, words: &[u32]) -> Result<()> {
        self.write_ordered(words, true)
    }

    /// Clock `words` out on the output line.
    ///
    /// With `reverse_output` the word list *and* the bit order inside each
    /// word are walked backwards (last word first, bit `word_size - 1`
    /// first). Without it both run forwards (first word first, bit 0 first).
    pub fn write_ordered(&mut self, words: &[u32], reverse_output: bool) -> Result<()> {
        let output = self.output.as_ref().ok_or_else(|| {
            GpioError::NotSupported("an output pin must be specified to write".to_string())
        })?;

        let max_word = self.max_word();
        let idle = 1 - self.polarity;
        let active = self.polarity;

        let mut bits: Vec<u8> = (0..self.word_size).collect();
        let mut ordered: Vec<u32> = words.to_vec();
        if reverse_output {
            bits.reverse();
            ordered.reverse();
        }

        debug!(
            "Soft SPI writing {} words (reverse_output={})",
            words.len(),
            reverse_output
        );

        for word in ordered {
            let word = word.min(max_word);
            for &bit in &bits {
                self.clock.set_value(idle)?;
                output.set_value(((word >> bit) & 1) as u8)?;
                self.clock.set_value(active)?;
            }
            self.clock.set_value(idle)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{trace, MockPin, PinOp, Trace};

    fn spi(trace: &Trace, polarity: u8, word_size: u8) -> SoftSpi<MockPin> {
        SoftSpi::builder()
            .clock(MockPin::new(1016, "XIO0", trace.clone()))
            .output(MockPin::new(1017, "XIO1", trace.clone()))
            .polarity(polarity)
            .word_size(word_size)
            .build()
            .unwrap()
    }

    fn values_of(trace: &Trace, name: &str) -> Vec<u8> {
        trace
            .lock()
            .iter()
            .filter(|(n, _)| n == name)
            .filter_map(|(_, op)| match op {
                PinOp::Value(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Output level at each active clock edge.
    fn sampled_bits(trace: &Trace, polarity: u8) -> Vec<u8> {
        let mut data = 0;
        let mut bits = Vec::new();
        let mut clock_level = 1 - polarity;
        for (name, op) in trace.lock().iter() {
            if let PinOp::Value(v) = op {
                match name.as_str() {
                    "XIO1" => data = *v,
                    "XIO0" => {
                        if *v == polarity && clock_level != polarity {
                            bits.push(data);
                        }
                        clock_level = *v;
                    }
                    _ => {}
                }
            }
        }
        bits
    }

    #[test]
    fn test_build_requires_clock() {
        let t = trace();
        let result = SoftSpi::builder()
            .output(MockPin::new(1, "XIO1", t))
            .build();
        assert!(matches!(result, Err(GpioError::Configuration(_))));
    }

    #[test]
    fn test_build_requires_a_data_line() {
        let t = trace();
        let result = SoftSpi::builder()
            .clock(MockPin::new(1, "XIO0", t))
            .build();
        assert!(matches!(result, Err(GpioError::Configuration(_))));
    }

    #[test]
    fn test_build_rejects_bad_clocking() {
        let t = trace();
        let bad_polarity = SoftSpi::builder()
            .clock(MockPin::new(1, "XIO0", t.clone()))
            .output(MockPin::new(2, "XIO1", t.clone()))
            .polarity(2)
            .build();
        assert!(matches!(bad_polarity, Err(GpioError::Configuration(_))));

        let bad_phase = SoftSpi::builder()
            .clock(MockPin::new(1, "XIO0", t.clone()))
            .output(MockPin::new(2, "XIO1", t))
            .phase(3)
            .build();
        assert!(matches!(bad_phase, Err(GpioError::Configuration(_))));
    }

    #[test]
    fn test_build_exports_and_drives_low() {
        let t = trace();
        let input = MockPin::new(1018, "XIO2", t.clone());
        let spi = SoftSpi::builder()
            .clock(MockPin::new(1016, "XIO0", t.clone()))
            .input(input)
            .build()
            .unwrap();

        let ops = t.lock().clone();
        for name in ["XIO0", "XIO2"] {
            let pin_ops: Vec<PinOp> = ops
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, op)| *op)
                .collect();
            assert_eq!(
                pin_ops,
                vec![
                    PinOp::Export,
                    PinOp::Direction(Direction::Output),
                    PinOp::Value(0)
                ]
            );
        }
        assert_eq!(spi.max_word(), 0xff);
    }

    #[test]
    fn test_write_without_output_not_supported() {
        let t = trace();
        let mut spi = SoftSpi::builder()
            .clock(MockPin::new(1016, "XIO0", t.clone()))
            .input(MockPin::new(1018, "XIO2", t))
            .build()
            .unwrap();
        assert!(matches!(spi.write(&[1]), Err(GpioError::NotSupported(_))));
    }

    #[test]
    fn test_zero_word_holds_output_low() {
        let t = trace();
        let mut spi = spi(&t, 1, 8);
        t.lock().clear();

        spi.write(&[0x00]).unwrap();

        let clock = values_of(&t, "XIO0");
        assert_eq!(clock.iter().filter(|v| **v == 1).count(), 8);
        assert_eq!(clock.last(), Some(&0));
        assert_eq!(values_of(&t, "XIO1"), vec![0; 8]);
    }

    #[test]
    fn test_full_word_holds_output_high() {
        let t = trace();
        let mut spi = spi(&t, 1, 8);
        t.lock().clear();

        spi.write(&[0xFF]).unwrap();

        assert_eq!(values_of(&t, "XIO0").iter().filter(|v| **v == 1).count(), 8);
        assert_eq!(values_of(&t, "XIO1"), vec![1; 8]);
    }

    #[test]
    fn test_edge_sequence_per_bit() {
        let t = trace();
        let mut spi = spi(&t, 1, 2);
        t.lock().clear();

        spi.write(&[0b10]).unwrap();

        let ops: Vec<(String, PinOp)> = t.lock().clone();
        let expected = vec![
            ("XIO0", 0),
            ("XIO1", 1),
            ("XIO0", 1),
            ("XIO0", 0),
            ("XIO1", 0),
            ("XIO0", 1),
            ("XIO0", 0),
        ];
        let ops: Vec<(&str, u8)> = ops
            .iter()
            .map(|(n, op)| match op {
                PinOp::Value(v) => (n.as_str(), *v),
                other => panic!("unexpected op {:?}", other),
            })
            .collect();
        assert_eq!(ops, expected);
    }

    #[test]
    fn test_reverse_output_reverses_words_and_bits() {
        let t = trace();
        let mut spi = spi(&t, 1, 4);
        t.lock().clear();

        spi.write_ordered(&[0b0001, 0b1100], true).unwrap();
        // Last word first, most significant bit first.
        assert_eq!(sampled_bits(&t, 1), vec![1, 1, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_forward_output_keeps_words_and_bits() {
        let t = trace();
        let mut spi = spi(&t, 0, 4);
        t.lock().clear();

        spi.write_ordered(&[0b0001, 0b1100], false).unwrap();
        // First word first, least significant bit first.
        assert_eq!(sampled_bits(&t, 0), vec![1, 0, 0, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_words_are_clamped() {
        let t = trace();
        let mut spi = spi(&t, 1, 4);
        t.lock().clear();

        spi.write(&[0x1234]).unwrap();
        assert_eq!(sampled_bits(&t, 1), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_full_width_words() {
        let t = trace();
        let spi = spi(&t, 1, 32);
        assert_eq!(spi.max_word(), u32::MAX);
    }
}
