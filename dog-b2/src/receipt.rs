use serde::{Deserialize, Serialize};

use crate::models::FileInfo;

/// Receipt returned after the server confirmed an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub file: FileInfo,
    pub bucket_id: String,
    pub size_bytes: u64,
    pub content_sha1: Option<String>,
    pub upload: UploadInfo,
    pub created_at: i64,
}

/// How the file reached the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UploadInfo {
    /// One upload-file call
    Single { attempts: u32 },
    /// start / upload-part / finish
    Large {
        file_id: String,
        part_size: u64,
        parts: Vec<PartReceipt>,
    },
}

/// A committed large-file part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartReceipt {
    pub part_number: u32,
    pub size_bytes: u64,
    pub content_sha1: String,
    /// Counted attempts, 1 when the first transmission succeeded
    pub attempts: u32,
}

impl UploadReceipt {
    pub fn new(file: FileInfo, bucket_id: String, size_bytes: u64, upload: UploadInfo) -> Self {
        Self {
            content_sha1: file.content_sha1.clone().filter(|sha1| sha1 != "none"),
            file,
            bucket_id,
            size_bytes,
            upload,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file.file_id
    }

    pub fn is_large(&self) -> bool {
        matches!(self.upload, UploadInfo::Large { .. })
    }

    /// Part checksums in part order; empty for single uploads
    pub fn part_sha1s(&self) -> Vec<String> {
        match &self.upload {
            UploadInfo::Single { .. } => Vec::new(),
            UploadInfo::Large { parts, .. } => parts.iter().map(|p| p.content_sha1.clone()).collect(),
        }
    }

    pub fn parts(&self) -> &[PartReceipt] {
        match &self.upload {
            UploadInfo::Single { .. } => &[],
            UploadInfo::Large { parts, .. } => parts,
        }
    }
}
