//! Synthetic signal source standing in for the real-time process. The
//! shipped buddy maps the process image out of shared memory; the demo
//! daemon generates an oscillator so every part of the pipeline can be
//! exercised without hardware.

use byteorder::{ByteOrder, LittleEndian};
use rtcom::producer::ImageSource;
use rtcom::registry::{DataType, Variable, VariableTable};
use std::f64::consts::PI;

const SINE_OFFSET: usize = 0;
const COSINE_OFFSET: usize = 8;
const TICKS_OFFSET: usize = 16;
pub const SIGNAL_IMAGE_LEN: usize = 24;

pub const PARAM_IMAGE_LEN: usize = 16;

pub struct Oscillator {
    /// Base tick period in seconds.
    period: f64,
    frequency: f64,
}

impl Oscillator {
    pub fn new(period: f64) -> Oscillator {
        Oscillator {
            period,
            frequency: 1.0,
        }
    }
}

impl ImageSource for Oscillator {
    fn image_len(&self) -> usize {
        SIGNAL_IMAGE_LEN
    }

    fn sample(&mut self, tick: u64, dst: &mut [u8]) {
        let t = tick as f64 * self.period;
        let phase = 2.0 * PI * self.frequency * t;

        LittleEndian::write_f64(&mut dst[SINE_OFFSET..SINE_OFFSET + 8], phase.sin());
        LittleEndian::write_f64(&mut dst[COSINE_OFFSET..COSINE_OFFSET + 8], phase.cos());
        LittleEndian::write_u64(&mut dst[TICKS_OFFSET..TICKS_OFFSET + 8], tick);
    }
}

fn var(
    path: &str,
    name: &str,
    data_type: DataType,
    offset: usize,
    sample_time: usize,
) -> Variable {
    Variable {
        id: 0,
        path: path.into(),
        name: name.into(),
        alias: None,
        data_type,
        dims: vec![],
        offset,
        sample_time,
    }
}

pub fn signal_table() -> VariableTable {
    VariableTable::build(
        vec![
            var("/osc/sine", "sine", DataType::F64, SINE_OFFSET, 0),
            var("/osc/cosine", "cosine", DataType::F64, COSINE_OFFSET, 0),
            var("/osc/ticks", "ticks", DataType::U64, TICKS_OFFSET, 1),
        ],
        SIGNAL_IMAGE_LEN,
    )
    .expect("oscillator signal table is static")
}

/// Tunables forwarded to the real-time side. The simulator acknowledges
/// writes without acting on them.
pub fn parameter_table() -> VariableTable {
    VariableTable::build(
        vec![
            var("/osc/amplitude", "amplitude", DataType::F64, 0, 0),
            var("/osc/offset", "offset", DataType::F64, 8, 0),
        ],
        PARAM_IMAGE_LEN,
    )
    .expect("oscillator parameter table is static")
}
