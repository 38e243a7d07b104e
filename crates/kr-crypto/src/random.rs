use crate::nacl::CryptoError;

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; len];
    getrandom::getrandom(&mut out).map_err(|_| CryptoError::Rng)?;
    Ok(out)
}

pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    getrandom::getrandom(&mut out).map_err(|_| CryptoError::Rng)?;
    Ok(out)
}

/// Encode a 128-bit value in base62, most significant digit first.
pub fn base62_u128(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(22);
    while n > 0 {
        digits.push(BASE62[(n % 62) as usize]);
        n /= 62;
    }
    digits.reverse();
    // BASE62 is ASCII
    String::from_utf8_lossy(&digits).into_owned()
}

/// Fresh random 128-bit identifier in base62 (request ids).
pub fn rand_128_base62() -> Result<String, CryptoError> {
    let bytes: [u8; 16] = random_array()?;
    Ok(base62_u128(u128::from_be_bytes(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn base62_small_values() {
        assert_eq!(base62_u128(0), "0");
        assert_eq!(base62_u128(61), "z");
        assert_eq!(base62_u128(62), "10");
    }

    #[test]
    fn base62_max_fits_22_digits() {
        assert_eq!(base62_u128(u128::MAX).len(), 22);
    }

    #[test]
    fn random_ids_do_not_collide() {
        let ids: HashSet<String> = (0..1000).map(|_| rand_128_base62().unwrap()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
