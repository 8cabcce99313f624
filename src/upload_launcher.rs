//! OTA Upload Tool
//! Upload launcher module
//!
//! This module provides functionality for:
//! 1. Validating the upload parameters entered by the user
//! 2. Building the command line for the wired flasher or the network uploader
//! 3. Running the external tool and relaying its output to a display sink

use chrono::Local;
use log::{ debug, error, info, warn };
use std::fmt;
use std::path::{ Path, PathBuf };
use thiserror::Error;

use crate::config_store::{ ConfigKey, ConfigStore };
use crate::console::{ DisplaySink, LineBuffer, Utf8ChunkDecoder };
use crate::process_runner::{ ProcessExit, ProcessHandle, ProcessSpawner };

pub const DEFAULT_FLASHER: &str = "st-flash";
pub const DEFAULT_FLASH_ADDRESS: &str = "0x08000000";
pub const DEFAULT_SCRIPT_RUNNER: &str = "node";
pub const DEFAULT_UPLOADER_SCRIPT: &str = "nota.js";

/// Which required field was left empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingField {
    File,
    Address,
    Port,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingField::File => write!(f, "Please select a firmware file"),
            MissingField::Address => write!(f, "Please enter the IP address"),
            MissingField::Port => write!(f, "Please enter the port"),
        }
    }
}

/// Custom error types for upload operations
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("{0}")]
    MissingInput(MissingField),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// How output from the child is handed to the display sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Complete lines only, used for the wired flasher
    Lines,
    /// Every chunk as soon as it is read, so progress bars update live
    Chunks,
}

/// A fully built external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub output_mode: OutputMode,
}

impl LaunchCommand {
    /// Command line for logging, with the auth token masked
    pub fn redacted(&self) -> String {
        let mut parts = vec![self.program.clone()];
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                parts.push("***".to_string());
            } else {
                parts.push(arg.clone());
            }
            mask_next = arg == "-a";
        }
        parts.join(" ")
    }
}

/// Parameters for one network upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRequest {
    pub firmware_path: String,
    pub target_address: String,
    pub target_port: String,
    pub auth_token: String,
    /// Human readable label passed to the uploader
    pub display_name: String,
    /// Ask the uploader to skip its own safety checks
    pub force: bool,
}

impl UploadRequest {
    /// Check required fields in order, stopping at the first empty one
    pub fn validate(&self) -> Result<(), MissingField> {
        if self.firmware_path.is_empty() {
            return Err(MissingField::File);
        }
        if self.target_address.is_empty() {
            return Err(MissingField::Address);
        }
        if self.target_port.is_empty() {
            return Err(MissingField::Port);
        }
        Ok(())
    }

    /// Arguments understood by the network uploader
    pub fn uploader_args(&self) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            self.firmware_path.clone(),
            "-i".to_string(),
            self.target_address.clone(),
            "-p".to_string(),
            self.target_port.clone(),
            "-n".to_string(),
            self.display_name.clone()
        ];

        if self.force {
            args.push("--force".to_string());
        }

        if !self.auth_token.is_empty() {
            args.push("-a".to_string());
            args.push(self.auth_token.clone());
        }

        args
    }
}

/// Base name of the current working directory, used as the upload label
pub fn display_name_from_cwd() -> String {
    std::env::current_dir()
        .ok()
        .and_then(|dir| dir.file_name().map(|name| name.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

/// The uploader script shipped next to the executable
pub fn default_uploader_script() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default()
        .join(DEFAULT_UPLOADER_SCRIPT)
}

/// Where the external tools live and how they are called
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherSettings {
    /// Interpreter that runs the uploader script
    pub script_runner: String,
    pub uploader_script: PathBuf,
    pub flasher: String,
    /// Flash base address passed to the wired flasher
    pub flash_address: String,
}

/// Starts the external tools and relays what they print
#[derive(Debug, Clone)]
pub struct UploadLauncher<S> {
    spawner: S,
    settings: LauncherSettings,
}

fn report<D: DisplaySink>(sink: &mut D, err: UploadError) -> UploadError {
    sink.append(&format!("Error: {}\n", err));
    err
}

impl<S: ProcessSpawner> UploadLauncher<S> {
    pub fn new(spawner: S, settings: LauncherSettings) -> Self {
        Self { spawner, settings }
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    /// Build the wired flasher command: write with a hardware reset at the
    /// configured base address
    pub fn prepare_local<D: DisplaySink>(
        &self,
        firmware_path: &str,
        sink: &mut D
    ) -> Result<LaunchCommand, UploadError> {
        if firmware_path.is_empty() {
            return Err(report(sink, UploadError::MissingInput(MissingField::File)));
        }

        Ok(LaunchCommand {
            program: self.settings.flasher.clone(),
            args: vec![
                "--reset".to_string(),
                "write".to_string(),
                firmware_path.to_string(),
                self.settings.flash_address.clone()
            ],
            output_mode: OutputMode::Lines,
        })
    }

    /// Validate the request, persist its values, and build the uploader
    /// command.
    ///
    /// Values are saved before anything is spawned so they become the next
    /// defaults even when the upload itself fails.
    pub fn prepare_ota<D: DisplaySink>(
        &self,
        request: &UploadRequest,
        store: &mut ConfigStore,
        sink: &mut D
    ) -> Result<LaunchCommand, UploadError> {
        if let Err(field) = request.validate() {
            return Err(report(sink, UploadError::MissingInput(field)));
        }

        let persisted = store.write_all([
            (ConfigKey::File, request.firmware_path.as_str()),
            (ConfigKey::Ip, request.target_address.as_str()),
            (ConfigKey::Port, request.target_port.as_str()),
            (ConfigKey::Auth, request.auth_token.as_str()),
        ]);
        if let Err(e) = persisted {
            error!("Failed to save upload settings to {}: {}", store.path().display(), e);
        }

        let mut args = vec![self.settings.uploader_script.to_string_lossy().into_owned()];
        args.extend(request.uploader_args());

        Ok(LaunchCommand {
            program: self.settings.script_runner.clone(),
            args,
            output_mode: OutputMode::Chunks,
        })
    }

    /// Flash over the wired programmer and wait for it to finish
    pub async fn flash_local<D: DisplaySink + Send>(
        &self,
        firmware_path: &str,
        sink: &mut D
    ) -> Result<ProcessExit, UploadError> {
        let command = self.prepare_local(firmware_path, sink)?;
        self.run(&command, sink).await
    }

    /// Upload over the network and wait for the uploader to finish
    pub async fn upload_ota<D: DisplaySink + Send>(
        &self,
        request: &UploadRequest,
        store: &mut ConfigStore,
        sink: &mut D
    ) -> Result<ProcessExit, UploadError> {
        let command = self.prepare_ota(request, store, sink)?;
        self.run(&command, sink).await
    }

    /// Spawn `command` and forward its output until the child exits.
    ///
    /// There is no timeout: a child that never exits keeps this pending.
    pub async fn run<D: DisplaySink + Send>(
        &self,
        command: &LaunchCommand,
        sink: &mut D
    ) -> Result<ProcessExit, UploadError> {
        info!("Running command: {}", command.redacted());

        let mut handle = match self.spawner.spawn(&command.program, &command.args) {
            Ok(handle) => handle,
            Err(source) => {
                error!("Failed to start {}: {}", command.program, source);
                return Err(
                    report(sink, UploadError::Spawn {
                        program: command.program.clone(),
                        source,
                    })
                );
            }
        };

        let mut decoder = Utf8ChunkDecoder::default();
        let mut lines = LineBuffer::default();
        let mut at_line_start = true;

        let mut forward = |sink: &mut D, text: &str| {
            if !text.is_empty() {
                at_line_start = text.ends_with('\n');
                sink.append(text);
            }
        };

        while let Some(chunk) = handle.next_chunk().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Error reading output of {}: {}", command.program, e);
                    break;
                }
            };
            debug!("Read {} bytes from {}", bytes.len(), command.program);

            let text = decoder.push(&bytes);
            match command.output_mode {
                OutputMode::Chunks => forward(&mut *sink, &text),
                OutputMode::Lines => {
                    for line in lines.push(&text) {
                        forward(&mut *sink, &line);
                    }
                }
            }
        }

        let tail = decoder.finish();
        match command.output_mode {
            OutputMode::Chunks => forward(&mut *sink, &tail),
            OutputMode::Lines => {
                for line in lines.push(&tail) {
                    forward(&mut *sink, &line);
                }
                if let Some(rest) = lines.finish() {
                    forward(&mut *sink, &rest);
                }
            }
        }

        let exit = match handle.wait().await {
            Ok(exit) => exit,
            Err(source) => {
                error!("Failed to wait for {}: {}", command.program, source);
                return Err(
                    report(sink, UploadError::Wait {
                        program: command.program.clone(),
                        source,
                    })
                );
            }
        };

        if exit.success() {
            info!("{} finished successfully", command.program);
        } else {
            warn!("{} exited with {}", command.program, exit);
        }

        let separator = if at_line_start { "" } else { "\n" };
        sink.append(
            &format!(
                "{}[{}] Process exited with {}\n",
                separator,
                Local::now().format("%H:%M:%S"),
                exit
            )
        );

        Ok(exit)
    }
}
