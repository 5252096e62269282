//! Mixing kernels
//!
//! Both kernels process eight lanes per iteration so the optimiser can emit
//! packed SIMD instructions, with a scalar loop for the tail. The result only
//! depends on the inputs and their order.

const LANES: usize = 8;

/// `dst[i] += src[i] * volume` over the common length.
pub fn mul_add(dst: &mut [f32], src: &[f32], volume: f32) {
    let len = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..len], &src[..len]);

    let mut dst_chunks = dst.chunks_exact_mut(LANES);
    let mut src_chunks = src.chunks_exact(LANES);
    for (d, s) in (&mut dst_chunks).zip(&mut src_chunks) {
        for (x, y) in d.iter_mut().zip(s) {
            *x += *y * volume;
        }
    }
    for (d, s) in dst_chunks
        .into_remainder()
        .iter_mut()
        .zip(src_chunks.remainder())
    {
        *d += *s * volume;
    }
}

/// `buf[i] *= volume`.
pub fn scale(buf: &mut [f32], volume: f32) {
    let mut chunks = buf.chunks_exact_mut(LANES);
    for c in &mut chunks {
        for lane in c.iter_mut() {
            *lane *= volume;
        }
    }
    for sample in chunks.into_remainder() {
        *sample *= volume;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_signals_cancel() {
        let mut dst = vec![0.5f32; 1024 * 2];
        let src = vec![-0.5f32; 1024 * 2];
        mul_add(&mut dst, &src, 1.0);
        assert!(dst.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_mul_add_handles_tail() {
        let mut dst = vec![1.0f32; 11];
        let src: Vec<f32> = (0..11).map(|i| i as f32).collect();
        mul_add(&mut dst, &src, 0.5);
        assert_eq!(dst[10], 6.0);
        assert_eq!(dst[3], 2.5);
    }

    #[test]
    fn test_mul_add_uses_shorter_length() {
        let mut dst = vec![0.0f32; 4];
        mul_add(&mut dst, &[1.0, 1.0], 1.0);
        assert_eq!(dst, vec![1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mix_is_deterministic() {
        let a: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.013).sin()).collect();
        let b: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.029).cos()).collect();

        let run = || {
            let mut out = a.clone();
            mul_add(&mut out, &b, 0.7);
            out
        };
        let first = run();
        let second = run();
        assert!(first.iter().zip(&second).all(|(x, y)| x.to_bits() == y.to_bits()));
    }

    #[test]
    fn test_scale() {
        let mut buf = vec![1.0f32; 9];
        scale(&mut buf, 0.25);
        assert!(buf.iter().all(|&s| s == 0.25));
    }
}
