//! Hex framing used by the u-blox socket commands (`AT+UDCONF=1,1`).

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Decode a hex string into `out`. Fails on odd length, non-hex digits or
/// overflow of `out`.
pub(crate) fn decode_hex(s: &str, out: &mut [u8]) -> Result<usize, ()> {
    let s = s.as_bytes();
    if s.len() % 2 != 0 || s.len() / 2 > out.len() {
        return Err(());
    }
    for (i, pair) in s.chunks_exact(2).enumerate() {
        let hi = hex_val(pair[0])?;
        let lo = hex_val(pair[1])?;
        out[i] = hi << 4 | lo;
    }
    Ok(s.len() / 2)
}

/// Encode `bytes` as uppercase hex, appending to `out`.
pub(crate) fn encode_hex<const N: usize>(
    bytes: &[u8],
    out: &mut heapless::String<N>,
) -> Result<(), ()> {
    for &b in bytes {
        out.push(HEX_DIGITS[(b >> 4) as usize] as char).map_err(|_| ())?;
        out.push(HEX_DIGITS[(b & 0x0f) as usize] as char).map_err(|_| ())?;
    }
    Ok(())
}

fn hex_val(c: u8) -> Result<u8, ()> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut s: heapless::String<16> = heapless::String::new();
        encode_hex(&[0x00, 0x7f, 0xab], &mut s).unwrap();
        assert_eq!(s.as_str(), "007FAB");

        let mut buf = [0u8; 8];
        let n = decode_hex("007fAB", &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x00, 0x7f, 0xab]);
    }

    #[test]
    fn rejects_bad_input() {
        let mut buf = [0u8; 8];
        assert!(decode_hex("abc", &mut buf).is_err());
        assert!(decode_hex("zz", &mut buf).is_err());
        assert!(decode_hex("00010203040506070809", &mut buf).is_err());
    }
}
