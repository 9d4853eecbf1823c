//! ARM64 Linux kernel "Image" header parser.
//!
//! Unlike x86's bzImage, the arm64 boot protocol requires only the trivial
//! 64-byte header documented at
//! <https://www.kernel.org/doc/html/latest/arch/arm64/booting.html>. There
//! is no setup-code / protected-mode split to peel apart: the whole file,
//! verbatim, is the image the VMM copies into guest memory.

use super::BootError;

/// Offset of the header within the image (it is the image's first bytes).
const HEADER_SIZE: usize = 64;

/// "ARM\x64" in little-endian, at offset 0x38 of the header.
const MAGIC: u32 = 0x644d_5241;

/// Flags bit indicating the kernel is placement-independent (can be
/// loaded at any 2 MiB-aligned address) when `text_offset` is 0.
const FLAG_PIE_BIT: u64 = 1 << 3;

/// Default `text_offset` used by kernels built before the placement
/// independent executable convention, or that fail to report one.
const DEFAULT_TEXT_OFFSET: u64 = 0x8_0000;

/// A parsed arm64 Image header plus the image bytes.
pub struct KernelImage {
    pub text_offset: u64,
    pub image_size: u64,
    pub flags: u64,
    pub bytes: Vec<u8>,
}

impl KernelImage {
    /// Read and parse a kernel image file.
    pub fn load(path: &str) -> Result<Self, BootError> {
        let bytes = std::fs::read(path).map_err(BootError::ReadFile)?;
        Self::parse(bytes)
    }

    fn parse(bytes: Vec<u8>) -> Result<Self, BootError> {
        if bytes.len() < HEADER_SIZE {
            return Err(BootError::KernelTooSmall(bytes.len()));
        }

        let word = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let dword = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());

        let _code0 = word(0x00);
        let _code1 = word(0x04);
        let text_offset = dword(0x08);
        let image_size = dword(0x10);
        let flags = dword(0x18);
        let magic = word(0x38);

        if magic != MAGIC {
            return Err(BootError::BadMagic(magic));
        }

        let text_offset = if text_offset == 0 && flags & FLAG_PIE_BIT != 0 {
            0
        } else if text_offset == 0 {
            DEFAULT_TEXT_OFFSET
        } else {
            text_offset
        };

        Ok(Self {
            text_offset,
            image_size,
            flags,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(text_offset: u64, flags: u64, magic: u32) -> Vec<u8> {
        let mut h = vec![0u8; HEADER_SIZE];
        h[0x08..0x10].copy_from_slice(&text_offset.to_le_bytes());
        h[0x18..0x20].copy_from_slice(&flags.to_le_bytes());
        h[0x38..0x3c].copy_from_slice(&magic.to_le_bytes());
        h
    }

    #[test]
    fn too_small_is_rejected() {
        let err = KernelImage::parse(vec![0u8; 10]).unwrap_err();
        assert!(matches!(err, BootError::KernelTooSmall(10)));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = header(0x8_0000, 0, 0xdead_beef);
        let err = KernelImage::parse(bytes).unwrap_err();
        assert!(matches!(err, BootError::BadMagic(0xdead_beef)));
    }

    #[test]
    fn good_magic_parses() {
        let bytes = header(0x8_0000, 0, MAGIC);
        let img = KernelImage::parse(bytes).unwrap();
        assert_eq!(img.text_offset, 0x8_0000);
    }

    #[test]
    fn zero_text_offset_without_pie_flag_falls_back_to_default() {
        let bytes = header(0, 0, MAGIC);
        let img = KernelImage::parse(bytes).unwrap();
        assert_eq!(img.text_offset, DEFAULT_TEXT_OFFSET);
    }

    #[test]
    fn zero_text_offset_with_pie_flag_stays_zero() {
        let bytes = header(0, FLAG_PIE_BIT, MAGIC);
        let img = KernelImage::parse(bytes).unwrap();
        assert_eq!(img.text_offset, 0);
    }
}
