use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "Derby", "derby-server")
}

/// Where race documents live when no directory is given on the command line.
///
/// Falls back to `./data` on systems without a home directory.
pub fn default_data_dir() -> PathBuf {
    match get_project_dirs() {
        Some(dirs) => dirs.data_dir().to_owned(),
        None => {
            log::warn!("No home directory found, storing race data in ./data");
            PathBuf::from("data")
        }
    }
}
