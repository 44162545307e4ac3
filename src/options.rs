//! Playback configuration and its mapping to mpv command-line flags.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configurable mpv launch options.
///
/// Field defaults match an audio-focused deployment: no video window, OSD
/// and default key bindings disabled, system-wide config ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MpvOptions {
  /// Don't show video for video files.
  #[serde(default = "default_true")]
  pub no_video: bool,

  /// Show videos in fullscreen mode.
  #[serde(default = "default_true")]
  pub fullscreen: bool,

  /// Screen to show videos on (0-32).
  #[serde(default = "default_screen")]
  pub screen: u32,

  /// A config file in a custom location to include.
  #[serde(default)]
  pub config_file: Option<PathBuf>,

  /// Ignore the default, system-wide mpv config.
  #[serde(default = "default_true")]
  pub ignore_system_config: bool,

  /// Hide the on-screen-controller.
  #[serde(default = "default_true")]
  pub hide_osc: bool,

  /// Disable default key bindings.
  #[serde(default = "default_true")]
  pub disable_key_input: bool,

  /// Additional arguments appended verbatim after the generated flags.
  #[serde(default)]
  pub extra_args: Vec<String>,
}

fn default_true() -> bool {
  true
}

fn default_screen() -> u32 {
  1
}

impl Default for MpvOptions {
  fn default() -> Self {
    Self {
      no_video: true,
      fullscreen: true,
      screen: default_screen(),
      config_file: None,
      ignore_system_config: true,
      hide_osc: true,
      disable_key_input: true,
      extra_args: Vec::new(),
    }
  }
}

impl MpvOptions {
  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), String> {
    if self.screen > 32 {
      return Err("Screen index must be between 0 and 32".to_string());
    }
    if let Some(file) = &self.config_file {
      if !file.is_file() {
        return Err(format!("Not a file: {}", file.display()));
      }
    }
    Ok(())
  }

  /// Arguments contributed by the option table, in table order.
  pub fn cli_args(&self) -> Vec<String> {
    let mut args = Vec::new();
    for option in OPTION_TABLE {
      let produced = (option.to_args)(self);
      log::trace!("option {} -> {:?}", option.key, produced);
      args.extend(produced);
    }
    args
  }
}

/// One configurable flag: a setting paired with a pure function from its
/// value to zero or more argument tokens. Yielding nothing means the flag is
/// absent entirely, never an empty token.
struct CliOption {
  key: &'static str,
  to_args: fn(&MpvOptions) -> Vec<String>,
}

static OPTION_TABLE: &[CliOption] = &[
  CliOption {
    key: "noVideo",
    to_args: |o| vec![format!("--video={}", if o.no_video { "no" } else { "auto" })],
  },
  CliOption {
    key: "fullscreen",
    to_args: |o| vec![format!("--fullscreen={}", if o.fullscreen { "yes" } else { "no" })],
  },
  CliOption {
    key: "screen",
    to_args: |o| vec![format!("--fs-screen={}", o.screen), format!("--screen={}", o.screen)],
  },
  CliOption {
    key: "configFile",
    to_args: |o| {
      o.config_file
        .iter()
        .map(|file| format!("--include={}", file.display()))
        .collect()
    },
  },
  CliOption {
    key: "ignoreSystemConfig",
    to_args: |o| {
      vec![format!(
        "--config={}",
        if o.ignore_system_config { "no" } else { "yes" }
      )]
    },
  },
  CliOption {
    key: "hideOsc",
    to_args: |o| {
      if o.hide_osc {
        vec!["--no-osc".to_string()]
      } else {
        Vec::new()
      }
    },
  },
  CliOption {
    key: "disableKeyInput",
    to_args: |o| {
      if o.disable_key_input {
        vec!["--no-input-default-bindings".to_string()]
      } else {
        Vec::new()
      }
    },
  },
];
