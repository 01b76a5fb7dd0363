//! 图片读取：沙箱内定位、格式识别、大小上限、base64 编码

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::core::ToolError;
use crate::llm::ImageInput;
use crate::tools::SafeFs;

/// 按文件头识别格式，失败时退回扩展名
pub fn detect_mime(bytes: &[u8], extension: Option<&str>) -> Option<&'static str> {
    let sniffed = match bytes {
        [0x89, b'P', b'N', b'G', ..] => Some("image/png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'B', b'M', ..] => Some("image/bmp"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Some("image/tiff"),
        _ => None,
    };
    sniffed.or_else(|| match extension?.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "webp" => Some("image/webp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    })
}

/// 从沙箱读取图片并编码
pub fn load_image(fs: &SafeFs, path: &str, max_bytes: u64) -> Result<ImageInput, ToolError> {
    let resolved = fs.resolve(path)?;
    let meta = std::fs::metadata(&resolved).map_err(|e| ToolError::Io(e.to_string()))?;
    if !meta.is_file() {
        return Err(ToolError::InvalidArguments(format!("not a file: {}", path)));
    }
    if meta.len() > max_bytes {
        return Err(ToolError::InvalidArguments(format!(
            "image too large: {} bytes (max {})",
            meta.len(),
            max_bytes
        )));
    }
    let bytes = std::fs::read(&resolved).map_err(|e| ToolError::Io(e.to_string()))?;
    let extension = resolved.extension().and_then(|e| e.to_str());
    let mime_type = detect_mime(&bytes, extension)
        .ok_or_else(|| ToolError::InvalidArguments(format!("unsupported image format: {}", path)))?;
    Ok(ImageInput {
        mime_type: mime_type.to_string(),
        base64: STANDARD.encode(&bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_detect_mime_prefers_magic_bytes() {
        assert_eq!(detect_mime(&PNG_HEADER, Some("jpg")), Some("image/png"));
        assert_eq!(detect_mime(b"not an image", Some("JPEG")), Some("image/jpeg"));
        assert_eq!(detect_mime(b"plain", Some("txt")), None);
        assert_eq!(detect_mime(b"plain", None), None);
    }

    #[test]
    fn test_load_image_encodes_and_enforces_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pic.png"), PNG_HEADER).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        let fs = SafeFs::new(dir.path(), 1024, &[]).unwrap();

        let image = load_image(&fs, "pic.png", 1024).unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(STANDARD.decode(&image.base64).unwrap(), PNG_HEADER);

        assert!(matches!(load_image(&fs, "pic.png", 4), Err(ToolError::InvalidArguments(_))));
        assert!(matches!(load_image(&fs, "notes.txt", 1024), Err(ToolError::InvalidArguments(_))));
        assert!(matches!(load_image(&fs, "nope.png", 1024), Err(ToolError::NotFound(_))));
    }
}
