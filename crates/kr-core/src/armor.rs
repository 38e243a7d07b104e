//! OpenPGP ASCII armor (RFC 4880 section 6).

use base64::{engine::general_purpose::STANDARD, Engine as _};

const CRC24_INIT: u32 = 0x00B7_04CE;
const CRC24_POLY: u32 = 0x0186_4CFB;
const LINE_LEN: usize = 64;

pub const PUBLIC_KEY_BLOCK: &str = "PGP PUBLIC KEY BLOCK";
pub const SIGNATURE_BLOCK: &str = "PGP SIGNATURE";

fn crc24(data: &[u8]) -> u32 {
    let mut crc = CRC24_INIT;
    for &b in data {
        crc ^= (b as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24_POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}

pub fn armor(block_type: &str, headers: &[(&str, &str)], data: &[u8]) -> String {
    let mut out = format!("-----BEGIN {}-----\n", block_type);
    for (k, v) in headers {
        out.push_str(&format!("{}: {}\n", k, v));
    }
    out.push('\n');

    let body = STANDARD.encode(data);
    for chunk in body.as_bytes().chunks(LINE_LEN) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }

    let crc = crc24(data).to_be_bytes();
    out.push('=');
    out.push_str(&STANDARD.encode(&crc[1..]));
    out.push('\n');
    out.push_str(&format!("-----END {}-----", block_type));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc24_of_empty_is_init() {
        assert_eq!(crc24(b""), CRC24_INIT);
    }

    #[test]
    fn armor_layout() {
        let data = vec![0x99u8; 100];
        let s = armor(PUBLIC_KEY_BLOCK, &[("Created With", "Kryptonite")], &data);
        let lines: Vec<&str> = s.lines().collect();
        assert_eq!(lines[0], "-----BEGIN PGP PUBLIC KEY BLOCK-----");
        assert_eq!(lines[1], "Created With: Kryptonite");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3].len(), 64);
        assert!(lines[lines.len() - 2].starts_with('='));
        assert_eq!(lines[lines.len() - 2].len(), 5);
        assert_eq!(lines[lines.len() - 1], "-----END PGP PUBLIC KEY BLOCK-----");
    }
}
