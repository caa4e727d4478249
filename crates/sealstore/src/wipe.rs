//! Best-effort zeroization of sensitive buffers.

use rand::RngCore;
use zeroize::Zeroize;

/// Overwrite a sensitive buffer so its contents cannot be recovered from
/// memory afterwards.
///
/// The buffer is first filled with random bytes, then zeroed through a
/// volatile write with a compiler fence (`Zeroize`), so the overwrite
/// survives optimization. Callers must not rely on the buffer's contents
/// after this returns.
///
/// Secrets must travel as mutable byte buffers; immutable strings cannot
/// be wiped and are rejected at the API boundary by construction.
pub fn wipe(data: &mut [u8]) {
    if data.is_empty() {
        return;
    }

    // Random fill first so no recognizable pattern remains if the final
    // zeroing is ever partially observed.
    rand::thread_rng().fill_bytes(data);
    data.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipe_zeroes_buffer() {
        let mut buf = b"super secret key material".to_vec();
        wipe(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn wipe_empty_is_noop() {
        let mut buf: Vec<u8> = Vec::new();
        wipe(&mut buf);
        assert!(buf.is_empty());
    }

    #[test]
    fn wipe_preserves_length() {
        let mut buf = vec![0xA5u8; 4096];
        wipe(&mut buf);
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
