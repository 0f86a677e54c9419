//! Vault file rendering.
//!
//! A vault artifact is a Markdown file with a front-matter block, written
//! once under `vault/<category>/<slug>-<fp8>.md` and never edited. New
//! content under an existing slug links back to its predecessor through
//! `supersedes` instead of replacing it.

use chrono::{SecondsFormat, Utc};
use tracing::debug;

use vaultgate_shared::{
    Artifact, Fingerprint, Result, StorageLayout, VaultArtifact, VaultCategory, VaultgateError,
    slugify, vault_id,
};
use vaultgate_storage::{Storage, write_atomic};

use crate::transform::first_heading;

#[derive(Debug, Clone)]
pub struct VaultWriter {
    layout: StorageLayout,
}

impl VaultWriter {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Write the vault file for an approved phase-2 artifact and return the
    /// record to register, plus whether a new file was written. Content
    /// already in the vault is not rewritten.
    pub async fn write(
        &self,
        storage: &Storage,
        artifact: &Artifact,
        document: &Fingerprint,
        body: &str,
    ) -> Result<(VaultArtifact, bool)> {
        let category = artifact.category.unwrap_or(VaultCategory::Note);
        let title = artifact
            .title
            .clone()
            .or_else(|| first_heading(body))
            .unwrap_or_else(|| "Untitled".to_string());
        let body = body.trim();

        let fingerprint = Fingerprint::of(format!("{category}\n{title}\n{body}").as_bytes());
        let id = vault_id(&fingerprint);
        if let Some(existing) = storage.get_vault_artifact(&id).await? {
            debug!(vault_id = %id, "content already in vault");
            return Ok((existing, false));
        }

        let slug = slugify(&title);
        let supersedes = storage
            .latest_vault_by_slug(category, &slug)
            .await?
            .filter(|prev| prev.fingerprint != fingerprint)
            .map(|prev| prev.id);
        let path = format!(
            "{}/{slug}-{}.md",
            category.dir_name(),
            &fingerprint.as_str()[..8]
        );

        let vault = VaultArtifact {
            id,
            source_artifact_id: artifact.id.clone(),
            document: document.clone(),
            category,
            title,
            slug,
            path,
            fingerprint,
            supersedes,
            created_at: Utc::now(),
        };

        let target = self.layout.vault_dir().join(&vault.path);
        write_atomic(&self.layout.scratch_dir(), &target, render(&vault, body)?.as_bytes()).await?;
        debug!(vault_id = %vault.id, path = %vault.path, "vault file written");
        Ok((vault, true))
    }

    /// Delete the file of a vault artifact that never got registered.
    pub async fn remove(&self, vault: &VaultArtifact) -> Result<()> {
        let target = self.layout.vault_dir().join(&vault.path);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {
                debug!(path = %vault.path, "unregistered vault file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultgateError::io(&target, e)),
        }
    }
}

fn render(vault: &VaultArtifact, body: &str) -> Result<String> {
    let title = serde_json::to_string(&vault.title)
        .map_err(|e| VaultgateError::validation(format!("title: {e}")))?;

    let mut out = String::from("---\n");
    out.push_str(&format!("id: {}\n", vault.id));
    out.push_str(&format!("title: {title}\n"));
    out.push_str(&format!("category: {}\n", vault.category));
    out.push_str(&format!("source_artifact: {}\n", vault.source_artifact_id));
    out.push_str(&format!("document: {}\n", vault.document));
    out.push_str(&format!(
        "created: {}\n",
        vault.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    if let Some(prev) = &vault.supersedes {
        out.push_str(&format!("supersedes: {prev}\n"));
    }
    out.push_str("---\n\n");
    out.push_str(&format!("# {}\n\n", vault.title));
    if !body.is_empty() {
        out.push_str(body);
        out.push('\n');
    }
    Ok(out)
}
