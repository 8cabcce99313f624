#![windows_subsystem = "windows"]

use anyhow::{ anyhow, Context, Result };
use eframe::egui::TextStyle;
use log::{ error, info, warn };
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

use ota_upload_tool::cli::Cli;
use ota_upload_tool::config_store::{ ConfigKey, ConfigStore };
use ota_upload_tool::console::{ ChannelSink, ConsoleBuffer };
use ota_upload_tool::process_runner::{ ProcessExit, SystemSpawner };
use ota_upload_tool::upload_launcher::{
    display_name_from_cwd,
    LaunchCommand,
    UploadLauncher,
    UploadRequest,
};

// Application state
pub struct OtaUploadApp {
    // Persisted settings
    store: ConfigStore,
    launcher: UploadLauncher<SystemSpawner>,

    // Label shown in the header and passed to the uploader
    display_name: String,

    // Input fields
    firmware_path: String,
    target_address: String,
    target_port: String,
    auth_token: String,

    // Output of the current and previous runs
    console: ConsoleBuffer,
    upload_in_progress: bool,

    // Runtime handles
    rt: tokio::runtime::Runtime,
    output_rx: Option<mpsc::UnboundedReceiver<String>>,
    complete_rx: Option<mpsc::UnboundedReceiver<Result<ProcessExit, String>>>,
}

impl OtaUploadApp {
    pub fn new(
        store: ConfigStore,
        launcher: UploadLauncher<SystemSpawner>,
        rt: tokio::runtime::Runtime
    ) -> Self {
        let firmware_path = store.read(ConfigKey::File).replace('\\', "/");
        let target_address = store.read(ConfigKey::Ip).to_string();
        let target_port = store.read(ConfigKey::Port).to_string();
        let auth_token = store.read(ConfigKey::Auth).to_string();

        Self {
            store,
            launcher,
            display_name: display_name_from_cwd(),
            firmware_path,
            target_address,
            target_port,
            auth_token,
            console: ConsoleBuffer::default(),
            upload_in_progress: false,
            rt,
            output_rx: None,
            complete_rx: None,
        }
    }
}

impl eframe::App for OtaUploadApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // Process worker messages first
        self.process_upload_messages();

        self.configure_ui_style(ctx);

        egui::CentralPanel::default().show(ctx, |ui| {
            self.show_upload_screen(ui, ctx);
        });

        // Keep progress output flowing while a run is active
        if self.upload_in_progress {
            ctx.request_repaint_after(Duration::from_millis(50));
        }
    }
}

impl OtaUploadApp {
    fn configure_ui_style(&self, ctx: &egui::Context) {
        let mut style = (*ctx.style()).clone();

        style.spacing.button_padding = egui::vec2(10.0, 6.0);
        style.spacing.item_spacing = egui::vec2(8.0, 6.0);

        style.text_styles.insert(
            TextStyle::Heading,
            egui::FontId::new(22.0, egui::FontFamily::Proportional)
        );
        style.text_styles.insert(
            TextStyle::Body,
            egui::FontId::new(15.0, egui::FontFamily::Proportional)
        );
        style.text_styles.insert(
            TextStyle::Button,
            egui::FontId::new(15.0, egui::FontFamily::Proportional)
        );
        style.text_styles.insert(
            TextStyle::Monospace,
            egui::FontId::new(12.0, egui::FontFamily::Monospace)
        ); // For uploader output

        ctx.set_style(style);
    }

    fn show_upload_screen(&mut self, ui: &mut egui::Ui, ctx: &egui::Context) {
        ui.vertical_centered(|ui| {
            ui.heading(&self.display_name);
        });
        ui.separator();

        let idle = !self.upload_in_progress;

        egui::Grid
            ::new("upload_fields")
            .num_columns(3)
            .spacing([10.0, 6.0])
            .show(ui, |ui| {
                ui.label("Firmware file:");
                ui.add(egui::TextEdit::singleline(&mut self.firmware_path).desired_width(320.0));
                if ui.add_enabled(idle, egui::Button::new("📁 Browse")).clicked() {
                    self.browse_firmware();
                }
                ui.end_row();

                ui.label("IP address:");
                ui.add(
                    egui::TextEdit
                        ::singleline(&mut self.target_address)
                        .desired_width(320.0)
                        .hint_text("192.168.1.100")
                );
                ui.label("");
                ui.end_row();

                ui.label("Port:");
                ui.add(
                    egui::TextEdit
                        ::singleline(&mut self.target_port)
                        .desired_width(320.0)
                        .hint_text("8266")
                );
                if ui.add_enabled(idle, egui::Button::new("🔌 USB Upload")).clicked() {
                    self.start_usb_upload(ctx);
                }
                ui.end_row();

                ui.label("Password:");
                ui.add(
                    egui::TextEdit
                        ::singleline(&mut self.auth_token)
                        .desired_width(320.0)
                        .password(true)
                );
                if ui.add_enabled(idle, egui::Button::new("📡 OTA Upload")).clicked() {
                    self.start_ota_upload(false, ctx);
                }
                ui.end_row();

                ui.label("");
                ui.label("");
                if ui.add_enabled(idle, egui::Button::new("⚠ OTA Force")).clicked() {
                    self.start_ota_upload(true, ctx);
                }
                ui.end_row();
            });

        // Validation feedback, host names are still allowed through
        let address_looks_valid = self.target_address.parse::<std::net::IpAddr>().is_ok();
        let port_valid = self.target_port.parse::<u16>().is_ok();

        if !address_looks_valid && !self.target_address.is_empty() {
            ui.colored_label(egui::Color32::YELLOW, "⚠ Address is not an IP address");
        }
        if !port_valid && !self.target_port.is_empty() {
            ui.colored_label(egui::Color32::YELLOW, "⚠ Port should be a number from 0 to 65535");
        }

        ui.separator();

        // Uploader output
        ui.group(|ui| {
            ui.horizontal(|ui| {
                ui.strong("Output");
                if self.upload_in_progress {
                    ui.spinner();
                    ui.label("Upload in progress...");
                }
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if ui.add_enabled(idle, egui::Button::new("🗑 Clear")).clicked() {
                        self.console.clear();
                    }
                });
            });

            egui::ScrollArea
                ::vertical()
                .max_height(320.0)
                .stick_to_bottom(true)
                .auto_shrink([false, false])
                .show(ui, |ui| {
                    let mut text = self.console.as_str();
                    ui.add(
                        egui::TextEdit
                            ::multiline(&mut text)
                            .font(TextStyle::Monospace)
                            .desired_width(f32::INFINITY)
                            .desired_rows(20)
                    );
                });
        });
    }

    fn browse_firmware(&mut self) {
        let cwd = std::env::current_dir().unwrap_or_default();

        if
            let Some(path) = rfd::FileDialog
                ::new()
                .set_title("Select file")
                .set_directory(&cwd)
                .add_filter("bin files", &["bin"])
                .add_filter("elf files", &["elf"])
                .pick_file()
        {
            self.firmware_path = relative_display_path(&path, &cwd);
            info!("Selected firmware: {}", self.firmware_path);
        }
    }

    // Background operations

    fn start_usb_upload(&mut self, ctx: &egui::Context) {
        if self.upload_in_progress {
            return;
        }

        match self.launcher.prepare_local(&self.firmware_path, &mut self.console) {
            Ok(command) => self.spawn_upload(command, ctx),
            Err(e) => warn!("USB upload not started: {}", e),
        }
    }

    fn start_ota_upload(&mut self, force: bool, ctx: &egui::Context) {
        if self.upload_in_progress {
            return;
        }

        let request = UploadRequest {
            firmware_path: self.firmware_path.clone(),
            target_address: self.target_address.trim().to_string(),
            target_port: self.target_port.trim().to_string(),
            auth_token: self.auth_token.clone(),
            display_name: self.display_name.clone(),
            force,
        };

        match self.launcher.prepare_ota(&request, &mut self.store, &mut self.console) {
            Ok(command) => self.spawn_upload(command, ctx),
            Err(e) => warn!("OTA upload not started: {}", e),
        }
    }

    fn spawn_upload(&mut self, command: LaunchCommand, ctx: &egui::Context) {
        let (output_tx, output_rx) = mpsc::unbounded_channel::<String>();
        let (complete_tx, complete_rx) = mpsc::unbounded_channel::<Result<ProcessExit, String>>();

        self.output_rx = Some(output_rx);
        self.complete_rx = Some(complete_rx);
        self.upload_in_progress = true;

        let launcher = self.launcher.clone();
        let mut sink = ChannelSink::new(output_tx).with_repaint(ctx.clone());
        let repaint_ctx = ctx.clone();

        self.rt.spawn(async move {
            let result = launcher.run(&command, &mut sink).await.map_err(|e| e.to_string());
            let _ = complete_tx.send(result);
            repaint_ctx.request_repaint();
        });
    }

    fn process_upload_messages(&mut self) {
        self.drain_output();

        let finished = self.complete_rx.as_mut().and_then(|rx| rx.try_recv().ok());
        if let Some(result) = finished {
            // Everything the worker sent before finishing is already queued
            self.drain_output();

            match result {
                Ok(exit) => info!("Upload finished with {}", exit),
                Err(e) => error!("Upload failed: {}", e),
            }

            self.upload_in_progress = false;
            self.output_rx = None;
            self.complete_rx = None;
        }
    }

    fn drain_output(&mut self) {
        if let Some(rx) = &mut self.output_rx {
            while let Ok(chunk) = rx.try_recv() {
                self.console.append(&chunk);
            }
        }
    }
}

/// Show `path` relative to `cwd` as `./...` with forward slashes
fn relative_display_path(path: &Path, cwd: &Path) -> String {
    match path.strip_prefix(cwd) {
        Ok(relative) => format!("./{}", relative.to_string_lossy().replace('\\', "/")),
        Err(_) => path.to_string_lossy().replace('\\', "/"),
    }
}

fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse_lenient(std::env::args_os());

    let mut store = ConfigStore::open(&cli.config);
    if let Err(e) = store.apply_overrides(cli.overrides()) {
        error!("Failed to save command line settings: {}", e);
    }

    let launcher = UploadLauncher::new(SystemSpawner, cli.launcher_settings());
    info!("Launcher settings: {:?}", launcher.settings());
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    let app = OtaUploadApp::new(store, launcher, rt);

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder
            ::default()
            .with_inner_size([780.0, 620.0])
            .with_resizable(false),
        centered: true,
        ..Default::default()
    };

    eframe
        ::run_native(
            "OTA Upload",
            options,
            Box::new(|_cc| Ok(Box::new(app)))
        )
        .map_err(|e| anyhow!("UI error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_relative_display_path_inside_cwd() {
        let cwd = PathBuf::from("/home/dev/blinky");
        let path = cwd.join("build").join("blinky.bin");
        assert_eq!(relative_display_path(&path, &cwd), "./build/blinky.bin");
    }

    #[test]
    fn test_relative_display_path_outside_cwd() {
        let cwd = PathBuf::from("/home/dev/blinky");
        let path = PathBuf::from("/tmp/other.elf");
        assert_eq!(relative_display_path(&path, &cwd), "/tmp/other.elf");
    }
}
