//! Root folder and uploaded file documents.

use automerge::{transaction::Transactable, AutoCommit, ObjType, ReadDoc, ScalarValue, ROOT};

use super::fields::{get_bytes, get_str};
use crate::error::{AccountError, AccountResult};

const TITLE: &str = "title";
const DOCS: &str = "docs";
const CONTENT_TYPE: &str = "contentType";
const CONTENTS: &str = "contents";
const EXTENSION: &str = "extension";

/// Root of an account's document tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderDoc {
    pub title: String,
    pub doc_count: usize,
}

impl FolderDoc {
    /// Initialize an empty folder
    pub fn init(doc: &mut AutoCommit, title: &str) -> AccountResult<()> {
        doc.put(&ROOT, TITLE, title)?;
        doc.put_object(&ROOT, DOCS, ObjType::List)?;
        Ok(())
    }

    pub fn read(doc: &AutoCommit) -> AccountResult<Self> {
        let doc_count = match doc.get(&ROOT, DOCS)? {
            Some((_, docs)) => doc.length(&docs),
            None => 0,
        };
        Ok(Self {
            title: get_str(doc, &ROOT, TITLE)?.unwrap_or_default(),
            doc_count,
        })
    }
}

/// Binary file stored as a document (used for avatars)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDoc {
    pub content_type: String,
    pub contents: Vec<u8>,
    pub extension: Option<String>,
}

impl FileDoc {
    pub fn new(content_type: impl Into<String>, contents: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            contents,
            extension: None,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Guess the content type from a file extension
    pub fn content_type_for_extension(extension: &str) -> &'static str {
        match extension.to_ascii_lowercase().as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "svg" => "image/svg+xml",
            _ => "application/octet-stream",
        }
    }

    pub fn write(&self, doc: &mut AutoCommit) -> AccountResult<()> {
        doc.put(&ROOT, CONTENT_TYPE, self.content_type.as_str())?;
        doc.put(&ROOT, CONTENTS, ScalarValue::Bytes(self.contents.clone()))?;
        if let Some(ext) = &self.extension {
            doc.put(&ROOT, EXTENSION, ext.as_str())?;
        }
        Ok(())
    }

    pub fn read(doc: &AutoCommit) -> AccountResult<Self> {
        let contents = get_bytes(doc, &ROOT, CONTENTS)?
            .ok_or_else(|| AccountError::Serialization("file document has no contents".into()))?;
        Ok(Self {
            content_type: get_str(doc, &ROOT, CONTENT_TYPE)?
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            contents,
            extension: get_str(doc, &ROOT, EXTENSION)?,
        })
    }
}
