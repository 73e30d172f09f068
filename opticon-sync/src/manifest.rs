//! Retrieval manifests grouped by metadata type.
//!
//! A [`Manifest`] names exactly the objects whose bodies must be fetched.
//! It serializes to a `package.xml` document for the metadata API, and a
//! deletion-only variant is written as a destructive-changes package.

use std::collections::BTreeMap;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use opticon_core::{Change, MetadataRecord};

use crate::error::{io_err, SyncError};

const PACKAGE_XMLNS: &str = "http://soap.sforce.com/2006/04/metadata";
pub const PACKAGE_FILE: &str = "package.xml";
pub const DESTRUCTIVE_FILE: &str = "destructiveChanges.xml";

/// `object_type → [full_name]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    types: BTreeMap<String, Vec<String>>,
}

impl Manifest {
    /// The placeholder manifest with no members.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Group records by type, keeping insertion order within a type.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a MetadataRecord>) -> Self {
        let mut manifest = Self::empty();
        for record in records {
            manifest.insert(&record.object_type, &record.full_name);
        }
        manifest
    }

    /// Manifest of every record in `changes` (the last known record for deletions).
    pub fn from_changes<'a>(changes: impl IntoIterator<Item = &'a Change>) -> Self {
        Self::from_records(changes.into_iter().map(Change::record))
    }

    fn insert(&mut self, object_type: &str, full_name: &str) {
        let members = self.types.entry(object_type.to_string()).or_default();
        if !members.iter().any(|m| m == full_name) {
            members.push(full_name.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Total number of members across every type.
    pub fn len(&self) -> usize {
        self.types.values().map(Vec::len).sum()
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn members(&self, object_type: &str) -> &[String] {
        self.types
            .get(object_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Render as a `package.xml` document: types and members sorted, text
    /// escaped by the writer.
    pub fn to_package_xml(&self, api_version: &str) -> Result<String, SyncError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
        emit(
            &mut writer,
            Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
        )?;
        let mut package = BytesStart::new("Package");
        package.push_attribute(("xmlns", PACKAGE_XMLNS));
        emit(&mut writer, Event::Start(package))?;
        for (object_type, members) in &self.types {
            emit(&mut writer, Event::Start(BytesStart::new("types")))?;
            let mut sorted: Vec<&String> = members.iter().collect();
            sorted.sort();
            for member in sorted {
                text_element(&mut writer, "members", member)?;
            }
            text_element(&mut writer, "name", object_type)?;
            emit(&mut writer, Event::End(BytesEnd::new("types")))?;
        }
        text_element(&mut writer, "version", api_version)?;
        emit(&mut writer, Event::End(BytesEnd::new("Package")))?;

        let mut xml = String::from_utf8(writer.into_inner())
            .map_err(|e| SyncError::Xml(e.to_string()))?;
        xml.push('\n');
        Ok(xml)
    }
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), SyncError> {
    writer
        .write_event(event)
        .map_err(|e| SyncError::Xml(e.to_string()))
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<(), SyncError> {
    emit(writer, Event::Start(BytesStart::new(name)))?;
    emit(writer, Event::Text(BytesText::new(text)))?;
    emit(writer, Event::End(BytesEnd::new(name)))
}

/// Write a destructive-changes package for `deletions` into `dir`.
///
/// Produces an empty `package.xml` plus `destructiveChanges.xml` listing the
/// deleted members. Non-deletion changes are ignored.
pub fn write_destructive_package(
    dir: &Path,
    deletions: &[Change],
    api_version: &str,
) -> Result<Manifest, SyncError> {
    let destructive = Manifest::from_changes(
        deletions
            .iter()
            .filter(|c| matches!(c, Change::Deletion(_))),
    );

    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let package = dir.join(PACKAGE_FILE);
    std::fs::write(&package, Manifest::empty().to_package_xml(api_version)?)
        .map_err(|e| io_err(&package, e))?;
    let path = dir.join(DESTRUCTIVE_FILE);
    std::fs::write(&path, destructive.to_package_xml(api_version)?)
        .map_err(|e| io_err(&path, e))?;

    tracing::info!(
        "wrote destructive package with {} member(s): {}",
        destructive.len(),
        path.display()
    );
    Ok(destructive)
}
