//! Routing-table-name installer.
//!
//! The policy routes refer to routing tables by name; iproute2 resolves
//! those names through its rt_tables file. This installer makes sure the
//! product's four table names exist there with unique indices, appending
//! only — pre-existing lines are never touched.
//!
//! Candidate paths are tried in order and the first existing file wins.
//! When only a non-primary candidate exists (some distributions ship
//! rt_tables under /usr/lib and no /etc/iproute2 at all), its content seeds
//! the primary path first and the appends go there.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use thiserror::Error;

use crate::routing;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no routing table name file exists among the candidate paths")]
    NoCandidateFile,
    #[error("invalid table index {index:?} in {}", path.display())]
    InvalidIndex { path: PathBuf, index: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct RtTablesInitializer {
    brand_prefix: String,
    candidate_paths: Vec<PathBuf>,
}

impl RtTablesInitializer {
    /// `candidate_paths` are tried in order; the first entry is the primary
    /// location that gets seeded when only a later candidate exists.
    pub fn new(
        brand_prefix: impl Into<String>,
        candidate_paths: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        Self {
            brand_prefix: brand_prefix.into(),
            candidate_paths: candidate_paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Initializer for the standard system locations.
    pub fn system(brand_prefix: impl Into<String>) -> Self {
        Self::new(
            brand_prefix,
            ["/etc/iproute2/rt_tables", "/usr/lib/iproute2/rt_tables"],
        )
    }

    /// The table names this installer ensures, in append order.
    pub fn table_names(&self) -> Vec<String> {
        routing::TABLE_SUFFIXES
            .iter()
            .map(|suffix| format!("{}{suffix}", self.brand_prefix))
            .collect()
    }

    /// Append any missing table names, numbering from one past the highest
    /// pre-existing index. Running this twice is a no-op on the second call.
    pub fn install(&self) -> Result<(), Error> {
        let target = self.prepare_target_file()?;
        let content = fs::read_to_string(&target)?;

        // Strict parse: a non-numeric index means the file is not ours to
        // fix, and appending could collide with whatever is going on there.
        let mut existing_names = Vec::new();
        let mut max_index: u32 = 0;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut fields = trimmed.split_whitespace();
            let index_field = fields.next().unwrap_or("");
            let index: u32 = index_field.parse().map_err(|_| Error::InvalidIndex {
                path: target.clone(),
                index: index_field.to_string(),
            })?;
            max_index = max_index.max(index);
            if let Some(name) = fields.next() {
                existing_names.push(name.to_string());
            }
        }

        let mut appended = String::new();
        let mut next_index = max_index + 1;
        for table in self.table_names() {
            if existing_names.iter().any(|name| *name == table) {
                continue;
            }
            appended.push_str(&format!("{next_index}\t{table}\n"));
            next_index += 1;
        }

        if appended.is_empty() {
            tracing::debug!(path = %target.display(), "all routing table names already present");
            return Ok(());
        }

        // One buffered write, so an I/O failure never half-appends.
        let mut file = fs::OpenOptions::new().append(true).open(&target)?;
        file.write_all(appended.as_bytes())?;
        tracing::info!(path = %target.display(), "appended routing table names");
        Ok(())
    }

    /// Pick the target file, seeding the primary path from a later candidate
    /// when the primary does not exist yet.
    fn prepare_target_file(&self) -> Result<PathBuf, Error> {
        let Some(primary) = self.candidate_paths.first() else {
            return Err(Error::NoCandidateFile);
        };
        let Some(existing) = self.candidate_paths.iter().find(|path| path.is_file()) else {
            tracing::error!("no routing table name file found among the candidate paths");
            return Err(Error::NoCandidateFile);
        };

        if existing == primary {
            return Ok(existing.clone());
        }

        // Seed the primary location; its parent directory may not exist
        // either (e.g. /etc/iproute2 on arch).
        tracing::info!(
            from = %existing.display(),
            to = %primary.display(),
            "seeding routing table name file"
        );
        let seed = fs::read_to_string(existing)?;
        if let Some(parent) = primary.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(primary, seed)?;
        Ok(primary.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn table_names_derive_from_the_brand_prefix() {
        let rt = RtTablesInitializer::new("acme", Vec::<PathBuf>::new());
        assert_eq!(
            rt.table_names(),
            vec!["acmevpnrt", "acmevpnOnlyrt", "acmevpnWgrt", "acmevpnFwdrt"]
        );
    }

    #[test]
    fn appends_after_the_existing_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let etc = dir.path().join("rt_tables");
        fs::write(&etc, "100\ttable1\n")?;

        let rt = RtTablesInitializer::new("aegis", [&etc]);
        rt.install()?;

        assert_eq!(
            read(&etc),
            "100\ttable1\n\
             101\taegisvpnrt\n\
             102\taegisvpnOnlyrt\n\
             103\taegisvpnWgrt\n\
             104\taegisvpnFwdrt\n"
        );
        Ok(())
    }

    #[test]
    fn indices_continue_from_the_highest_regardless_of_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let etc = dir.path().join("rt_tables");
        fs::write(&etc, "100\ttable1\n150\ttable2\n87\ttable3\n")?;

        let rt = RtTablesInitializer::new("aegis", [&etc]);
        rt.install()?;

        assert_eq!(
            read(&etc),
            "100\ttable1\n\
             150\ttable2\n\
             87\ttable3\n\
             151\taegisvpnrt\n\
             152\taegisvpnOnlyrt\n\
             153\taegisvpnWgrt\n\
             154\taegisvpnFwdrt\n"
        );
        Ok(())
    }

    #[test]
    fn only_missing_tables_are_added() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let etc = dir.path().join("rt_tables");
        fs::write(&etc, "100\ttable1\n101\taegisvpnrt\n102\taegisvpnOnlyrt\n")?;

        let rt = RtTablesInitializer::new("aegis", [&etc]);
        rt.install()?;

        assert_eq!(
            read(&etc),
            "100\ttable1\n\
             101\taegisvpnrt\n\
             102\taegisvpnOnlyrt\n\
             103\taegisvpnWgrt\n\
             104\taegisvpnFwdrt\n"
        );
        Ok(())
    }

    #[test]
    fn non_numeric_index_fails_without_writing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let etc = dir.path().join("rt_tables");
        fs::write(&etc, "not_an_index\ttable1\n")?;

        let rt = RtTablesInitializer::new("aegis", [&etc]);
        let result = rt.install();

        assert!(matches!(result, Err(Error::InvalidIndex { .. })));
        assert_eq!(read(&etc), "not_an_index\ttable1\n");
        Ok(())
    }

    #[test]
    fn fails_when_no_candidate_exists() {
        let rt = RtTablesInitializer::new(
            "aegis",
            ["/nonexistent/etc/rt_tables", "/nonexistent/lib/rt_tables"],
        );
        assert!(matches!(rt.install(), Err(Error::NoCandidateFile)));
    }

    #[test]
    fn prefers_the_primary_when_both_candidates_exist() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let etc = dir.path().join("etc_rt_tables");
        let lib = dir.path().join("lib_rt_tables");
        fs::write(&etc, "100\ttable1\n")?;
        fs::write(&lib, "500\ttable2\n")?;

        let rt = RtTablesInitializer::new("aegis", [&etc, &lib]);
        rt.install()?;

        assert_eq!(
            read(&etc),
            "100\ttable1\n\
             101\taegisvpnrt\n\
             102\taegisvpnOnlyrt\n\
             103\taegisvpnWgrt\n\
             104\taegisvpnFwdrt\n"
        );
        // The lib candidate is ignored entirely.
        assert_eq!(read(&lib), "500\ttable2\n");
        Ok(())
    }

    #[test]
    fn seeds_the_primary_from_the_lib_candidate() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let etc = dir.path().join("etc_rt_tables");
        let lib = dir.path().join("lib_rt_tables");
        fs::write(&lib, "100\ttable1\n")?;

        let rt = RtTablesInitializer::new("aegis", [&etc, &lib]);
        rt.install()?;

        assert_eq!(
            read(&etc),
            "100\ttable1\n\
             101\taegisvpnrt\n\
             102\taegisvpnOnlyrt\n\
             103\taegisvpnWgrt\n\
             104\taegisvpnFwdrt\n"
        );
        // The seed file itself stays untouched.
        assert_eq!(read(&lib), "100\ttable1\n");
        Ok(())
    }

    #[test]
    fn creates_nested_parent_directories_for_the_primary() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let etc = dir.path().join("a/b/c/rt_tables");
        let lib = dir.path().join("lib_rt_tables");
        fs::write(&lib, "100\ttable1\n")?;

        let rt = RtTablesInitializer::new("aegis", [&etc, &lib]);
        rt.install()?;

        assert!(etc.is_file());
        assert!(read(&etc).ends_with("104\taegisvpnFwdrt\n"));
        Ok(())
    }

    #[test]
    fn second_install_is_a_no_op() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let etc = dir.path().join("rt_tables");
        fs::write(&etc, "100\ttable1\n")?;

        let rt = RtTablesInitializer::new("aegis", [&etc]);
        rt.install()?;
        let after_first = read(&etc);

        rt.install()?;
        assert_eq!(read(&etc), after_first);
        Ok(())
    }

    #[test]
    fn comments_and_blank_lines_are_preserved_and_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let etc = dir.path().join("rt_tables");
        fs::write(&etc, "# reserved\n\n255\tlocal\n254\tmain\n")?;

        let rt = RtTablesInitializer::new("aegis", [&etc]);
        rt.install()?;

        assert_eq!(
            read(&etc),
            "# reserved\n\n255\tlocal\n254\tmain\n\
             256\taegisvpnrt\n\
             257\taegisvpnOnlyrt\n\
             258\taegisvpnWgrt\n\
             259\taegisvpnFwdrt\n"
        );
        Ok(())
    }
}
