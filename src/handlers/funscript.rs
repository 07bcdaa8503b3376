// src/handlers/funscript.rs

//! Funscript request handler module
//!
//! Loads the funscript of a video together with its multi-axis siblings
//! (`<video>.<axis>.funscript`) and hands them to the player as tracks.

use log::{info, warn, error};
use actix_web::{
    web,
    HttpResponse
};
use std::{
    env,
    path::{
        Component,
        PathBuf,
        Path
    },
    sync::Arc
};
use tokio::fs;
use walkdir::WalkDir;
use crate::tcode::{
    funscript_utils::{FunscriptData, Track},
    player
};
use super::types::{ErrorResponse, FunscriptResponse, TrackSummary};

const FUNSCRIPT_EXTENSION: &str = "funscript";

/// Handles requests to load the funscripts of a video
///
/// This handler:
/// 1. Resolves the main funscript next to the video
/// 2. Discovers sibling axis scripts sharing the video's name
/// 3. Installs all of them as player tracks
///
/// # Arguments
/// * `path` - The path to the video file, relative to `VIDEO_SHARE_PATH`
///
/// # Returns
/// * `HttpResponse` - JSON summary of the loaded tracks and channel bindings
/// * Returns 400 for paths escaping the share
/// * Returns 404 if no funscript was found
/// * Returns 500 for server configuration errors
pub async fn handle_funscript(path: web::Path<String>) -> HttpResponse {
    let requested_video_path = path.into_inner();
    info!("Handling funscript request for video: {}", &requested_video_path);

    // Get base path from environment
    let video_base_path = match env::var("VIDEO_SHARE_PATH") {
        Ok(p) => p,
        Err(e) => {
            error!("VIDEO_SHARE_PATH environment variable not set: {}", e);
            return HttpResponse::InternalServerError()
                .json(ErrorResponse::new("VIDEO_SHARE_PATH not set"));
        }
    };

    let funscript_filepath = match get_funscript_path_for_video(&requested_video_path, &video_base_path) {
        Ok(p) => p,
        Err(e) => {
            error!("Path determination error: {}", e);
            return HttpResponse::BadRequest().json(ErrorResponse::new(e));
        }
    };

    let tracks = match load_tracks(&funscript_filepath).await {
        Ok(tracks) => tracks,
        Err(e) => {
            info!("Responding with 404 Not Found for {}: {}", requested_video_path, e);
            return HttpResponse::NotFound().json(ErrorResponse::new(e));
        }
    };

    let summaries: Vec<TrackSummary> = tracks
        .iter()
        .enumerate()
        .map(|(index, track)| TrackSummary::new(index, track))
        .collect();

    match player::with_player(|player| {
        player.set_tracks(tracks);
        player.status().channels
    }) {
        Ok(channels) => {
            info!("Responding with 200 OK for: {}", requested_video_path);
            HttpResponse::Ok().json(FunscriptResponse {
                tracks: summaries,
                channels,
            })
        }
        Err(e) => {
            error!("Failed to hand tracks to the player: {}", e);
            HttpResponse::InternalServerError().json(ErrorResponse::new(e))
        }
    }
}

/// Constructs the path to a funscript file based on the video path
///
/// # Arguments
/// * `requested_video_path` - Relative path to the video file
/// * `video_base_path` - Base directory for video files
///
/// # Returns
/// * `Ok(PathBuf)` - Full path to the funscript file
/// * `Err(String)` - Error message if the path leaves the base directory
fn get_funscript_path_for_video(
    requested_video_path: &str,
    video_base_path: &str,
) -> Result<PathBuf, String> {
    let requested = Path::new(requested_video_path);
    if requested
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(format!("Invalid video path: {}", requested_video_path));
    }
    let video_path = PathBuf::from(video_base_path).join(requested);
    Ok(video_path.with_extension(FUNSCRIPT_EXTENSION))
}

/// Finds `<stem>.<axis>.funscript` files next to the main funscript
///
/// # Returns
/// Paths of the sibling scripts, sorted by file name
fn discover_axis_scripts(main_funscript: &Path) -> Vec<PathBuf> {
    let (Some(dir), Some(stem)) = (main_funscript.parent(), main_funscript.file_stem()) else {
        return Vec::new();
    };
    let prefix = format!("{}.", stem.to_string_lossy());
    let suffix = format!(".{}", FUNSCRIPT_EXTENSION);

    let mut scripts: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry while looking for axis scripts: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(&suffix) && name.len() > prefix.len() + suffix.len()
        })
        .map(|entry| entry.into_path())
        .collect();
    scripts.retain(|p| p != main_funscript);
    scripts
}

/// Loads the main funscript and its axis siblings as tracks
///
/// A missing main script is not an error as long as some axis script exists.
///
/// # Returns
/// * `Ok(Vec<Arc<Track>>)` - Main track first, then the axis tracks
/// * `Err(String)` - No script could be loaded
async fn load_tracks(main_funscript: &Path) -> Result<Vec<Arc<Track>>, String> {
    let mut tracks = Vec::new();
    let mut main_error = None;

    match read_and_deserialize_funscript(main_funscript).await {
        Ok(data) => tracks.push(Arc::new(Track::from_funscript(track_name(main_funscript), &data))),
        Err(e) => main_error = Some(e),
    }

    for script in discover_axis_scripts(main_funscript) {
        match read_and_deserialize_funscript(&script).await {
            Ok(data) => {
                info!("Loaded axis script {:?}", script.file_name().unwrap_or_default());
                tracks.push(Arc::new(Track::from_funscript(track_name(&script), &data)));
            }
            Err(e) => warn!("{}", e),
        }
    }

    if tracks.is_empty() {
        return Err(main_error.unwrap_or_else(|| format!("No funscript found for {:?}", main_funscript)));
    }
    if let Some(e) = main_error {
        warn!("Main script missing, using axis scripts only: {}", e);
    }
    Ok(tracks)
}

/// Track name is the file name without the `.funscript` extension
fn track_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Reads and parses a funscript file from disk
///
/// # Arguments
/// * `filepath` - Path to the funscript file
///
/// # Returns
/// * `Ok(FunscriptData)` - Parsed funscript data
/// * `Err(String)` - Error message if reading or parsing fails
async fn read_and_deserialize_funscript(filepath: &Path) -> Result<FunscriptData, String> {
    let content = fs::read_to_string(filepath)
        .await
        .map_err(|e| format!("Failed to read file {:?}: {}", filepath, e))?;

    serde_json::from_str(&content)
        .map_err(|e| format!("Failed to deserialize file {:?}: {}", filepath, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;

    const SCRIPT: &str = r#"{"actions":[{"at":0,"pos":10},{"at":500.4,"pos":90}]}"#;

    #[test]
    fn funscript_path_replaces_extension() {
        let path = get_funscript_path_for_video("clips/a.mp4", "/share").unwrap();
        assert_eq!(path, PathBuf::from("/share/clips/a.funscript"));
        assert!(get_funscript_path_for_video("../etc/passwd", "/share").is_err());
        assert!(get_funscript_path_for_video("/etc/passwd", "/share").is_err());
    }

    #[test]
    fn axis_scripts_are_discovered_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "clip.funscript",
            "clip.roll.funscript",
            "clip.twist.funscript",
            "clip.mp4",
            "clipper.roll.funscript",
            "other.pitch.funscript",
        ] {
            std_fs::write(dir.path().join(name), SCRIPT).unwrap();
        }

        let found = discover_axis_scripts(&dir.path().join("clip.funscript"));
        let names: Vec<String> = found.iter().map(|p| track_name(p)).collect();
        assert_eq!(names, vec!["clip.roll", "clip.twist"]);
    }

    #[tokio::test]
    async fn tracks_load_main_script_first() {
        let dir = tempfile::tempdir().unwrap();
        std_fs::write(dir.path().join("clip.funscript"), SCRIPT).unwrap();
        std_fs::write(dir.path().join("clip.pitch.funscript"), SCRIPT).unwrap();
        std_fs::write(dir.path().join("clip.roll.funscript"), "not json").unwrap();

        let tracks = load_tracks(&dir.path().join("clip.funscript")).await.unwrap();
        let names: Vec<&str> = tracks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["clip", "clip.pitch"]);
        assert_eq!(tracks[0].keyframes[1].at, 500);
    }

    #[tokio::test]
    async fn axis_scripts_alone_are_enough() {
        let dir = tempfile::tempdir().unwrap();
        std_fs::write(dir.path().join("clip.surge.funscript"), SCRIPT).unwrap();
        let tracks = load_tracks(&dir.path().join("clip.funscript")).await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].name, "clip.surge");
    }

    #[tokio::test]
    async fn missing_scripts_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_tracks(&dir.path().join("clip.funscript")).await.unwrap_err();
        assert!(err.contains("clip.funscript"));
    }
}
