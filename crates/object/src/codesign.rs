// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE and CONTRIBUTING.

// ad-hoc mach-o code signature.
//
// apple silicon refuses to execute an unsigned binary, so the writer
// appends a minimal SuperBlob: one CodeDirectory with a SHA-256 hash
// per 4096-byte page of the file prefix (everything before the
// signature itself), the ad-hoc flag set, and the binary basename as
// the identifier. no certificates, no entitlements, no special slots.
//
// all multi-byte fields in the signature structures are big-endian,
// unlike the rest of the file.

use sha2::{Digest, Sha256};

use crate::ByteBuffer;

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
const CSSLOT_CODEDIRECTORY: u32 = 0;

const CS_ADHOC: u32 = 0x2;
const CS_EXECSEG_MAIN_BINARY: u64 = 0x1;

const CD_VERSION: u32 = 0x20400;
const HASH_SIZE: u8 = 32;
const HASH_TYPE_SHA256: u8 = 2;
const PAGE_SHIFT: u8 = 12;
const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

// superblob header (12) + one blob index (8)
const SUPERBLOB_HEADER_LEN: usize = 20;
// code directory fields through execSegFlags, version 0x20400
const CD_HEADER_LEN: usize = 0x58;

/// the total byte size of the signature for the given code limit, so
/// the LC_CODE_SIGNATURE command can be written before the hashes exist
pub fn signature_size(code_limit: usize, identifier: &str) -> usize {
    let slots = code_limit.div_ceil(PAGE_SIZE);
    SUPERBLOB_HEADER_LEN + CD_HEADER_LEN + identifier.len() + 1 + slots * HASH_SIZE as usize
}

/// build the SuperBlob over file[..code_limit].
///
/// 'text_seg_size' is the vm size of the __TEXT segment, recorded in
/// the executable-segment fields the kernel checks on arm64.
pub fn build_signature(file: &[u8], code_limit: usize, identifier: &str, text_seg_size: u64) -> Vec<u8> {
    let slots = code_limit.div_ceil(PAGE_SIZE);
    let ident_bytes = identifier.len() + 1;
    let cd_len = CD_HEADER_LEN + ident_bytes + slots * HASH_SIZE as usize;
    let total_len = SUPERBLOB_HEADER_LEN + cd_len;

    let mut out = ByteBuffer::new();

    // superblob
    out.put_u32_be(CSMAGIC_EMBEDDED_SIGNATURE);
    out.put_u32_be(total_len as u32);
    out.put_u32_be(1);
    out.put_u32_be(CSSLOT_CODEDIRECTORY);
    out.put_u32_be(SUPERBLOB_HEADER_LEN as u32);

    // code directory
    let ident_offset = CD_HEADER_LEN as u32;
    let hash_offset = (CD_HEADER_LEN + ident_bytes) as u32;
    out.put_u32_be(CSMAGIC_CODEDIRECTORY);
    out.put_u32_be(cd_len as u32);
    out.put_u32_be(CD_VERSION);
    out.put_u32_be(CS_ADHOC);
    out.put_u32_be(hash_offset);
    out.put_u32_be(ident_offset);
    out.put_u32_be(0); // nSpecialSlots
    out.put_u32_be(slots as u32);
    out.put_u32_be(code_limit as u32);
    out.put_u8(HASH_SIZE);
    out.put_u8(HASH_TYPE_SHA256);
    out.put_u8(0); // platform
    out.put_u8(PAGE_SHIFT);
    out.put_u32_be(0); // spare2
    out.put_u32_be(0); // scatterOffset
    out.put_u32_be(0); // teamOffset
    out.put_u32_be(0); // spare3
    out.put_u64_be(0); // codeLimit64
    out.put_u64_be(0); // execSegBase
    out.put_u64_be(text_seg_size);
    out.put_u64_be(CS_EXECSEG_MAIN_BINARY);

    out.put_bytes(identifier.as_bytes());
    out.put_u8(0);

    for page in 0..slots {
        let start = page * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(code_limit);
        let digest = Sha256::digest(&file[start..end]);
        out.put_bytes(&digest);
    }

    debug_assert_eq!(out.buf.len(), total_len);
    out.buf
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sha2::{Digest, Sha256};

    use super::{build_signature, signature_size, PAGE_SIZE};

    #[test]
    fn test_size_prediction_matches() {
        for limit in [1, PAGE_SIZE - 1, PAGE_SIZE, PAGE_SIZE + 1, 5 * PAGE_SIZE] {
            let file = vec![0xabu8; limit];
            let blob = build_signature(&file, limit, "a.out", 0x4000);
            assert_eq!(blob.len(), signature_size(limit, "a.out"));
        }
    }

    #[test]
    fn test_superblob_shape() {
        let file = vec![1u8; PAGE_SIZE + 10];
        let blob = build_signature(&file, file.len(), "demo", 0x4000);

        assert_eq!(&blob[0..4], &0xfade0cc0u32.to_be_bytes());
        // one blob index pointing just past the superblob header
        assert_eq!(u32::from_be_bytes(blob[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_be_bytes(blob[16..20].try_into().unwrap()), 20);
        assert_eq!(&blob[20..24], &0xfade0c02u32.to_be_bytes());
    }

    #[test]
    fn test_page_hashes() {
        let mut file = vec![0u8; 2 * PAGE_SIZE + 100];
        for (i, byte) in file.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let limit = file.len();
        let blob = build_signature(&file, limit, "x", 0x4000);

        let hash_offset = u32::from_be_bytes(blob[36..40].try_into().unwrap()) as usize;
        let slots = u32::from_be_bytes(blob[48..52].try_into().unwrap()) as usize;
        assert_eq!(slots, 3);

        let cd = &blob[20..];
        let first = &cd[hash_offset..hash_offset + 32];
        assert_eq!(first, Sha256::digest(&file[0..PAGE_SIZE]).as_slice());
        let last = &cd[hash_offset + 64..hash_offset + 96];
        assert_eq!(
            last,
            Sha256::digest(&file[2 * PAGE_SIZE..limit]).as_slice()
        );
    }
}
