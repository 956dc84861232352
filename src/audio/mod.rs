//! Narrowband audio codec primitives.
//!
//! The carrier wire format is G.711 µ-law at 8 kHz in 20 ms frames; the
//! speech model consumes 16-bit linear PCM at 16 kHz and produces it at
//! 24 kHz. Everything here is a pure function over sample slices — no
//! allocation beyond the output buffer, no state.

/// G.711 µ-law bias.
const BIAS: i32 = 0x84;

/// Largest magnitude representable before companding.
const CLIP: i32 = 32635;

/// Samples per millisecond on the 8 kHz carrier leg.
pub const CARRIER_SAMPLES_PER_MS: usize = 8;

/// One 20 ms carrier frame, in bytes of µ-law.
pub const FRAME_BYTES: usize = 160;

/// Decode a single µ-law byte to a signed 16-bit linear sample.
pub fn mulaw_decode(byte: u8) -> i16 {
    let b = !byte;
    let sign = b & 0x80;
    let exponent = ((b >> 4) & 0x07) as i32;
    let mantissa = (b & 0x0f) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode a signed 16-bit linear sample as one µ-law byte.
pub fn mulaw_encode(sample: i16) -> u8 {
    let mut value = sample as i32;
    let sign: u8 = if value < 0 {
        value = -value;
        0x80
    } else {
        0
    };
    if value > CLIP {
        value = CLIP;
    }
    value += BIAS;

    // Locate the highest set bit in [14..7]; that is the exponent.
    let mut exponent: u32 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (value & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((value >> (exponent + 3)) & 0x0f) as u8;
    !(sign | ((exponent as u8) << 4) | mantissa)
}

/// Decode a µ-law buffer to linear PCM.
pub fn mulaw_decode_buf(data: &[u8]) -> Vec<i16> {
    data.iter().map(|&b| mulaw_decode(b)).collect()
}

/// Encode a linear PCM buffer to µ-law.
pub fn mulaw_encode_buf(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| mulaw_encode(s)).collect()
}

/// Upsample 8 kHz PCM to 16 kHz by emitting each sample followed by the
/// mean of it and its successor. The final sample is repeated.
pub fn upsample_8k_to_16k(pcm: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(pcm.len() * 2);
    for (i, &s) in pcm.iter().enumerate() {
        let next = pcm.get(i + 1).copied().unwrap_or(s);
        out.push(s);
        out.push(((s as i32 + next as i32) / 2) as i16);
    }
    out
}

/// Downsample 24 kHz PCM to 8 kHz by non-overlapping 3-tap averaging.
/// A partial final group is padded by repeating its last sample.
pub fn downsample_24k_to_8k(pcm: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(pcm.len().div_ceil(3));
    for group in pcm.chunks(3) {
        let last = *group.last().expect("chunks never yields empty slices");
        let mut sum: i32 = group.iter().map(|&s| s as i32).sum();
        sum += last as i32 * (3 - group.len()) as i32;
        out.push((sum / 3) as i16);
    }
    out
}

/// Reinterpret little-endian PCM16 bytes as samples. An odd trailing byte
/// is ignored; callers that stream chunks carry it over themselves.
pub fn pcm_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialize samples as little-endian PCM16 bytes.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// WAV packaging for the split-mode STT post.
///
/// The endpoint expects a complete RIFF/WAVE file: fmt chunk of size 16,
/// PCM format tag, mono, with the byte rate and block align derived from
/// 16-bit samples.
pub mod wav {
    /// Build a 44-byte WAV header for mono PCM16 audio.
    pub fn header(data_size: u32, sample_rate: u32) -> [u8; 44] {
        let channels: u16 = 1;
        let bits_per_sample: u16 = 16;
        let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
        let block_align = channels * bits_per_sample / 8;

        let mut header = [0u8; 44];
        header[0..4].copy_from_slice(b"RIFF");
        header[4..8].copy_from_slice(&(36 + data_size).to_le_bytes());
        header[8..12].copy_from_slice(b"WAVE");
        header[12..16].copy_from_slice(b"fmt ");
        header[16..20].copy_from_slice(&16u32.to_le_bytes());
        header[20..22].copy_from_slice(&1u16.to_le_bytes());
        header[22..24].copy_from_slice(&channels.to_le_bytes());
        header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
        header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
        header[32..34].copy_from_slice(&block_align.to_le_bytes());
        header[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());
        header[36..40].copy_from_slice(b"data");
        header[40..44].copy_from_slice(&data_size.to_le_bytes());
        header
    }

    /// Wrap mono PCM16 samples in a complete WAV file.
    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let data = super::samples_to_pcm_bytes(samples);
        let mut wav = Vec::with_capacity(44 + data.len());
        wav.extend_from_slice(&header(data.len() as u32, sample_rate));
        wav.extend_from_slice(&data);
        wav
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_silence_is_0xff() {
        assert_eq!(mulaw_encode(0), 0xff);
        assert_eq!(mulaw_decode(0xff), 0);
    }

    #[test]
    fn mulaw_decode_known_extremes() {
        // 0x00 is the most negative code word, 0x80 the most positive.
        assert_eq!(mulaw_decode(0x00), -32124);
        assert_eq!(mulaw_decode(0x80), 32124);
    }

    #[test]
    fn mulaw_encode_clips_out_of_range() {
        assert_eq!(mulaw_encode(i16::MAX), mulaw_encode(32635));
        assert_eq!(mulaw_encode(i16::MIN), mulaw_encode(-32635));
    }

    #[test]
    fn mulaw_round_trip_is_stable_on_its_output() {
        // enc(dec(enc(dec(x)))) == enc(dec(x)) for every code word.
        for byte in 0u8..=255 {
            let once = mulaw_encode(mulaw_decode(byte));
            let twice = mulaw_encode(mulaw_decode(once));
            assert_eq!(once, twice, "unstable at code word {byte:#04x}");
        }
    }

    #[test]
    fn mulaw_quantization_error_is_bounded() {
        // Error grows with magnitude; the largest segment step is 1024,
        // so the reconstruction error never exceeds half of that.
        for sample in (-32000i16..32000).step_by(97) {
            let decoded = mulaw_decode(mulaw_encode(sample)) as i32;
            assert!(
                (decoded - sample as i32).abs() <= 512,
                "error too large at {sample}: decoded {decoded}"
            );
        }
    }

    #[test]
    fn upsample_preserves_dc() {
        let dc = vec![1234i16; 80];
        let up = upsample_8k_to_16k(&dc);
        assert_eq!(up.len(), 160);
        assert!(up.iter().all(|&s| s == 1234));
    }

    #[test]
    fn upsample_interpolates_midpoints() {
        let up = upsample_8k_to_16k(&[0, 100]);
        assert_eq!(up, vec![0, 50, 100, 100]);
    }

    #[test]
    fn downsample_preserves_dc() {
        for dc in [-7000i16, 0, 421, 30000] {
            let signal = vec![dc; 240];
            let down = downsample_24k_to_8k(&signal);
            assert_eq!(down.len(), 80);
            assert!(down.iter().all(|&s| s == dc), "dc {dc} not preserved");
        }
    }

    #[test]
    fn downsample_pads_partial_tail_group() {
        // [3, 3, | 9] -> second group padded to [9, 9, 9].
        let down = downsample_24k_to_8k(&[3, 3, 3, 9]);
        assert_eq!(down, vec![3, 9]);
    }

    #[test]
    fn downsample_averages_groups() {
        let down = downsample_24k_to_8k(&[0, 3, 6, 10, 20, 30]);
        assert_eq!(down, vec![3, 20]);
    }

    #[test]
    fn pcm_byte_round_trip() {
        let samples = vec![-1, 0, 1, i16::MAX, i16::MIN, 512];
        let bytes = samples_to_pcm_bytes(&samples);
        assert_eq!(pcm_bytes_to_samples(&bytes), samples);
    }

    #[test]
    fn wav_header_fields() {
        let file = wav::from_samples(&[0i16; 8000], 8000);
        assert_eq!(&file[0..4], b"RIFF");
        assert_eq!(&file[8..12], b"WAVE");
        assert_eq!(&file[12..16], b"fmt ");
        // fmt chunk size 16, PCM tag 1, mono.
        assert_eq!(u32::from_le_bytes(file[16..20].try_into().unwrap()), 16);
        assert_eq!(u16::from_le_bytes(file[20..22].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(file[22..24].try_into().unwrap()), 1);
        // 8 kHz, byte rate 16000, block align 2, 16 bits.
        assert_eq!(u32::from_le_bytes(file[24..28].try_into().unwrap()), 8000);
        assert_eq!(u32::from_le_bytes(file[28..32].try_into().unwrap()), 16000);
        assert_eq!(u16::from_le_bytes(file[32..34].try_into().unwrap()), 2);
        assert_eq!(u16::from_le_bytes(file[34..36].try_into().unwrap()), 16);
        assert_eq!(file.len(), 44 + 16000);
    }
}
