//! Wire codec for partial per-spectrum results: a fixed-size record plus a
//! quantized 128-sample histogram tail, exchanged between nodes so the
//! owner can rebuild each spectrum's full score distribution.

use crate::error::EngineError;
use crate::survival::{leftmost_at_least, rightmost_at_least};

/// Samples in an encoded histogram tail.
pub const TAIL_SAMPLES: usize = 128;

/// Quantization levels used when a histogram holds more PSMs than a u16
/// sample can carry.
pub const QUANT_LEVELS: u32 = 65_500;

/// Bytes of one record on the wire.
pub const RECORD_BYTES: usize = 16;

/// Bytes of one tail payload on the wire.
pub const TAIL_BYTES: usize = TAIL_SAMPLES * 2;

/// Fixed-size header describing one spectrum's encoded tail.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PartialRecord {
    /// First occupied histogram bin
    pub min: u16,
    /// Last occupied histogram bin
    pub max2: u16,
    /// Best local hyperscore
    pub max: f32,
    /// Local candidate-PSM count
    pub n: i32,
    pub query_id: i32,
}

impl PartialRecord {
    /// Little-endian layout: `u16 min, u16 max2, f32 max, i32 n, i32 qid`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.min.to_le_bytes());
        out.extend_from_slice(&self.max2.to_le_bytes());
        out.extend_from_slice(&self.max.to_le_bytes());
        out.extend_from_slice(&self.n.to_le_bytes());
        out.extend_from_slice(&self.query_id.to_le_bytes());
    }

    pub fn read(buf: &[u8]) -> Result<Self, EngineError> {
        if buf.len() < RECORD_BYTES {
            return Err(EngineError::TransferFailure(format!(
                "short partial record: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            min: u16::from_le_bytes([buf[0], buf[1]]),
            max2: u16::from_le_bytes([buf[2], buf[3]]),
            max: f32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            n: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            query_id: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// Compress the occupied region of a raw score histogram into a fixed
/// 128-sample, 16-bit tail. Counts are stored raw when they fit, otherwise
/// rescaled into [`QUANT_LEVELS`] levels.
pub fn encode_tail(
    survival: &[f64],
    cpsms: u32,
    max_hyperscore: f32,
    query_id: i32,
) -> (PartialRecord, [u16; TAIL_SAMPLES]) {
    let hi = survival.len() - 1;
    let mut end = rightmost_at_least(survival, 0, hi, 0.99);
    let start = leftmost_at_least(survival, 0, end, 0.99);
    if end - start + 1 > TAIL_SAMPLES {
        end = start + TAIL_SAMPLES - 1;
    }

    let mut samples = [0u16; TAIL_SAMPLES];
    for (slot, bin) in (start..=end).enumerate() {
        let mut level = survival[bin] as u32;
        if cpsms > QUANT_LEVELS {
            level = (level as u64 * QUANT_LEVELS as u64 / cpsms as u64) as u32;
        }
        samples[slot] = level.min(u16::MAX as u32) as u16;
    }

    let record = PartialRecord {
        min: start as u16,
        max2: end as u16,
        max: max_hyperscore,
        n: cpsms as i32,
        query_id,
    };
    (record, samples)
}

/// Undo the encoder's quantization for a single sample.
#[inline]
pub fn dequantize(sample: u16, n: i32) -> f64 {
    if n > QUANT_LEVELS as i32 {
        sample as f64 * n as f64 / QUANT_LEVELS as f64
    } else {
        sample as f64
    }
}

/// Serialize a group of records destined for one node, in ascending
/// query-id order as produced by the batch.
pub fn write_group(records: &[(PartialRecord, [u16; TAIL_SAMPLES])], out: &mut Vec<u8>) {
    for (record, samples) in records {
        record.write(out);
        for sample in samples {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
}

/// Parse a group serialized by [`write_group`].
pub fn read_group(buf: &[u8]) -> Result<Vec<(PartialRecord, [u16; TAIL_SAMPLES])>, EngineError> {
    const FRAME: usize = RECORD_BYTES + TAIL_BYTES;
    if buf.len() % FRAME != 0 {
        return Err(EngineError::TransferFailure(format!(
            "payload length {} not a whole number of records",
            buf.len()
        )));
    }

    let mut out = Vec::with_capacity(buf.len() / FRAME);
    for frame in buf.chunks_exact(FRAME) {
        let record = PartialRecord::read(frame)?;
        let mut samples = [0u16; TAIL_SAMPLES];
        for (i, pair) in frame[RECORD_BYTES..].chunks_exact(2).enumerate() {
            samples[i] = u16::from_le_bytes([pair[0], pair[1]]);
        }
        out.push((record, samples));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::survival::HISTOGRAM_BINS;

    fn histogram(bins: &[(usize, f64)]) -> Vec<f64> {
        let mut yy = vec![0.0; HISTOGRAM_BINS];
        for &(bin, count) in bins {
            yy[bin] = count;
        }
        yy
    }

    #[test]
    fn roundtrip_is_exact_below_quantization() {
        let yy = histogram(&[(50, 12.0), (51, 7.0), (53, 1.0)]);
        let cpsms = 20u32;
        let (record, samples) = encode_tail(&yy, cpsms, 5.3, 42);

        assert_eq!(record.min, 50);
        assert_eq!(record.max2, 53);
        assert_eq!(record.n, 20);
        assert_eq!(record.query_id, 42);

        for bin in record.min as usize..=record.max2 as usize {
            let decoded = dequantize(samples[bin - record.min as usize], record.n);
            assert_eq!(decoded, yy[bin]);
        }
    }

    #[test]
    fn quantization_error_is_bounded() {
        let n = 200_000u32;
        let mut yy = vec![0.0; HISTOGRAM_BINS];
        for bin in 40..90 {
            yy[bin] = (n as f64 / 50.0).floor() + (bin % 7) as f64;
        }
        let (record, samples) = encode_tail(&yy, n, 8.9, 7);

        let bound = (n as f64 / QUANT_LEVELS as f64).ceil();
        for bin in record.min as usize..=record.max2 as usize {
            let decoded = dequantize(samples[bin - record.min as usize], record.n);
            assert!(
                (decoded - yy[bin]).abs() <= bound,
                "bin {}: {} vs {}",
                bin,
                decoded,
                yy[bin]
            );
        }
    }

    #[test]
    fn wide_tails_are_clipped_to_payload() {
        let mut yy = vec![0.0; HISTOGRAM_BINS];
        for bin in 0..400 {
            yy[bin] = 1.0;
        }
        let (record, _) = encode_tail(&yy, 400, 2.0, 0);
        assert_eq!(record.max2 as usize - record.min as usize + 1, TAIL_SAMPLES);
    }

    #[test]
    fn wire_group_roundtrip() {
        let yy = histogram(&[(10, 3.0), (11, 2.0)]);
        let a = encode_tail(&yy, 5, 2.1, 1);
        let b = encode_tail(&yy, 5, 3.3, 2);

        let mut bytes = Vec::new();
        write_group(&[a, b], &mut bytes);
        assert_eq!(bytes.len(), 2 * (RECORD_BYTES + TAIL_BYTES));

        let decoded = read_group(&bytes).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn truncated_group_is_rejected() {
        let mut bytes = vec![0u8; RECORD_BYTES + TAIL_BYTES - 1];
        bytes[0] = 1;
        assert!(read_group(&bytes).is_err());
    }
}
