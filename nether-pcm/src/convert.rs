//! Sample representation to and from normalised `f32`

use crate::format::DataFormat;
use crate::packet::SoundPacket;

const S16_SCALE: f32 = 32768.0;
const S32_SCALE: f64 = 2_147_483_648.0;

/// Position of `(frame, channel)` as `(plane, index)` within a packet.
#[inline]
fn locate(packet: &SoundPacket, frame: usize, channel: usize) -> (usize, usize) {
    if packet.planes() == 1 {
        (0, frame * packet.channels() + channel)
    } else {
        (channel, frame)
    }
}

/// Decode frames `[offset, offset + count)` of `src`, appending one `f32`
/// vector per channel to `out`.
pub fn read_frames(src: &SoundPacket, offset: usize, count: usize, out: &mut [Vec<f32>]) {
    let channels = src.channels().min(out.len());
    for (channel, dst) in out.iter_mut().enumerate().take(channels) {
        dst.reserve(count);
        match src.format().container().to_interleaved() {
            DataFormat::U8 => {
                for frame in offset..offset + count {
                    let (plane, index) = locate(src, frame, channel);
                    let value = src.plane::<u8>(plane)[index];
                    dst.push((value as f32 - 128.0) / 128.0);
                }
            }
            DataFormat::S16 => {
                for frame in offset..offset + count {
                    let (plane, index) = locate(src, frame, channel);
                    dst.push(src.plane::<i16>(plane)[index] as f32 / S16_SCALE);
                }
            }
            DataFormat::S32 => {
                for frame in offset..offset + count {
                    let (plane, index) = locate(src, frame, channel);
                    dst.push((src.plane::<i32>(plane)[index] as f64 / S32_SCALE) as f32);
                }
            }
            _ => {
                for frame in offset..offset + count {
                    let (plane, index) = locate(src, frame, channel);
                    dst.push(src.plane::<f32>(plane)[index]);
                }
            }
        }
    }
}

/// Encode `input[channel][..count]` into `dst` starting at frame `start`.
///
/// Does not touch `nb_samples`; the caller accounts for the written frames.
pub fn write_frames(dst: &mut SoundPacket, start: usize, input: &[Vec<f32>], count: usize) {
    let channels = dst.channels().min(input.len());
    let format = dst.format().container().to_interleaved();
    for (channel, samples) in input.iter().enumerate().take(channels) {
        for (i, &value) in samples.iter().take(count).enumerate() {
            let (plane, index) = locate(dst, start + i, channel);
            match format {
                DataFormat::U8 => {
                    dst.plane_mut::<u8>(plane)[index] =
                        (value.clamp(-1.0, 1.0) * 127.0 + 128.0).round() as u8;
                }
                DataFormat::S16 => {
                    dst.plane_mut::<i16>(plane)[index] =
                        (value * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
                }
                DataFormat::S32 => {
                    dst.plane_mut::<i32>(plane)[index] = (value as f64 * 2_147_483_647.0)
                        .round()
                        .clamp(-S32_SCALE, S32_SCALE - 1.0)
                        as i32;
                }
                _ => {
                    dst.plane_mut::<f32>(plane)[index] = value;
                }
            }
        }
    }
}
