//! Directory provisioning.
//!
//! Every directory the manifest declares is created before any file is
//! installed. A plain file sitting where a directory belongs is removed.

use std::fs;

use tracing::{debug, info};

use crate::context::UpdateSession;
use crate::error::{UpdateError, UpdateResult};
use crate::manifest::{install_path, ManifestDatabase};
use crate::progress::{ratio, ProgressSink, Reporter};

/// Create the declared directory tree under the install root.
///
/// With `skip_download` set, a cached database from earlier in the cycle is
/// reused. Returns the number of directories created.
pub fn provision_directories(
    session: &mut UpdateSession,
    sink: &dyn ProgressSink,
    skip_download: bool,
) -> UpdateResult<usize> {
    let reporter = Reporter::new(sink);
    reporter.overall(0.0, "Building directory tree...");

    let result = ManifestDatabase::open_cached(session, skip_download)
        .and_then(|db| create_tree(session, &db, &reporter));

    match result {
        Ok(created) => {
            info!(created, "Directory tree ready");
            Ok(created)
        }
        Err(e) => {
            reporter.fail(format!("Failed to build directory tree: {}", e));
            Err(e)
        }
    }
}

fn create_tree(
    session: &UpdateSession,
    db: &ManifestDatabase,
    reporter: &Reporter<'_>,
) -> UpdateResult<usize> {
    let root = &session.context().install_root;
    let total = db.directory_count()?;
    let mut created = 0;

    for (index, dir) in db.directories()?.iter().enumerate() {
        let checked = index as u64 + 1;
        reporter.overall(
            ratio(checked, total),
            format!("Checking directory {} of {}: {}", checked, total, dir),
        );

        let path = install_path(root, dir);
        if path.is_dir() {
            continue;
        }
        if fs::symlink_metadata(&path).is_ok() {
            debug!(path = %path.display(), "Removing file where a directory belongs");
            fs::remove_file(&path).map_err(|e| UpdateError::WriteFailed {
                path: path.clone(),
                source: e,
            })?;
        }

        fs::create_dir_all(&path).map_err(|e| UpdateError::CreateDirFailed {
            path: path.clone(),
            source: e,
        })?;
        created += 1;
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::UpdateContext;
    use crate::manifest::database::fixture;
    use crate::progress::{Channel, NullSink, ProgressEvent, ProgressUpdate};
    use std::sync::mpsc;
    use tempfile::TempDir;

    const VERSION_INI: &str =
        "[Download]\nVersion=5\nRetry=1\nWait=0\nDB file=db/server.db.5.cab\nDL root=patch\n";

    fn session_with_cached_db(temp: &TempDir, dirs: &[&str]) -> UpdateSession {
        let state = temp.path().join("state");
        fs::create_dir_all(&state).unwrap();
        fs::write(state.join("version.ini"), VERSION_INI).unwrap();
        fixture::build(&state.join("server.db"), &[], dirs);

        let ctx = UpdateContext::new("http://127.0.0.1:9", temp.path().join("install"))
            .with_state_dir(&state);
        let config = EngineConfig::default().with_temp_dir(temp.path().join("tmp"));
        UpdateSession::new(ctx, config).unwrap()
    }

    #[test]
    fn test_creates_missing_directories() {
        let temp = TempDir::new().unwrap();
        let mut session = session_with_cached_db(&temp, &["S1Game", "S1Game/Config", "Binaries"]);
        let (tx, rx) = mpsc::channel();

        let created = provision_directories(&mut session, &tx, true).unwrap();

        assert_eq!(created, 3);
        assert!(temp.path().join("install/S1Game/Config").is_dir());
        let labels: Vec<String> = rx
            .try_iter()
            .filter_map(|e: ProgressEvent| match e.update {
                ProgressUpdate::Progress { label, .. } if e.channel == Channel::Overall => {
                    Some(label)
                }
                _ => None,
            })
            .collect();
        assert!(labels.contains(&"Checking directory 1 of 3: Binaries".to_string()));
        assert!(labels.contains(&"Checking directory 3 of 3: S1Game/Config".to_string()));
    }

    #[test]
    fn test_existing_directories_are_not_recreated() {
        let temp = TempDir::new().unwrap();
        let mut session = session_with_cached_db(&temp, &["Binaries", "S1Game"]);
        fs::create_dir_all(temp.path().join("install/Binaries")).unwrap();
        fs::create_dir_all(temp.path().join("install/S1Game")).unwrap();

        let created = provision_directories(&mut session, &NullSink, true).unwrap();
        assert_eq!(created, 0);
    }

    #[test]
    fn test_file_in_the_way_is_replaced() {
        let temp = TempDir::new().unwrap();
        let mut session = session_with_cached_db(&temp, &["Binaries"]);
        fs::create_dir_all(temp.path().join("install")).unwrap();
        fs::write(temp.path().join("install/Binaries"), b"not a dir").unwrap();

        provision_directories(&mut session, &NullSink, true).unwrap();
        assert!(temp.path().join("install/Binaries").is_dir());
    }

    #[test]
    fn test_uncreatable_directory_is_fatal() {
        let temp = TempDir::new().unwrap();
        // "Binaries/app.exe" is a file, so "Binaries/app.exe/sub" cannot exist.
        let mut session = session_with_cached_db(&temp, &["Binaries", "Binaries/app.exe/sub"]);
        fs::create_dir_all(temp.path().join("install/Binaries")).unwrap();
        fs::write(temp.path().join("install/Binaries/app.exe"), b"x").unwrap();
        let (tx, rx) = mpsc::channel();

        let result = provision_directories(&mut session, &tx, true);

        assert!(matches!(result, Err(UpdateError::CreateDirFailed { .. })));
        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e.update, ProgressUpdate::Error { .. })));
        match &events.last().unwrap().update {
            ProgressUpdate::Progress { fraction, .. } => assert_eq!(*fraction, 1.0),
            other => panic!("Expected final progress, got {:?}", other),
        }
    }
}
