//! Port and DFU device listing.

use {
    super::{Ctx, print_json},
    anyhow::{Context, Result},
    console::style,
    log::debug,
    meadow_hcom::{
        DetectedPort, DeviceInfo, DfuContext, SerialConfig, UsbDeviceInfo, auto_detect_port,
        detect_ports, probe_port,
    },
    serde::Serialize,
    std::time::Duration,
};

/// How long a probed port gets to answer.
const PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Serialize)]
struct ProbedPort<'a> {
    #[serde(flatten)]
    port: &'a DetectedPort,
    device_info: Option<DeviceInfo>,
}

/// List serial ports, optionally confirming which ones answer as a Meadow.
pub(crate) async fn cmd_list_ports(ctx: &Ctx, json: bool, probe: bool) -> Result<()> {
    let detected = detect_ports();

    let answers = if probe {
        let timeout = ctx
            .timeout
            .unwrap_or(PROBE_TIMEOUT);
        let mut answers = Vec::with_capacity(detected.len());
        for port in &detected {
            let serial = SerialConfig::new(&port.name, ctx.baud_rate());
            let info = probe_port(&serial, timeout)
                .await
                .unwrap_or_else(|e| {
                    debug!("Probe of {} failed: {e}", port.name);
                    None
                });
            answers.push(info);
        }
        Some(answers)
    } else {
        None
    };

    if json {
        return match answers {
            Some(answers) => {
                let probed: Vec<ProbedPort<'_>> = detected
                    .iter()
                    .zip(answers)
                    .map(|(port, device_info)| ProbedPort { port, device_info })
                    .collect();
                print_json(&probed)
            },
            None => print_json(&detected),
        };
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for (i, port) in detected
        .iter()
        .enumerate()
    {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        let answer = match answers
            .as_ref()
            .map(|a| a[i].as_ref())
        {
            Some(Some(info)) => format!(
                " {} {}",
                style("✓").green(),
                info.os_version()
                    .map(|v| format!("Meadow OS {v}"))
                    .unwrap_or_else(|| "Meadow".to_string())
            ),
            Some(None) => format!(" {}", style("no answer").dim()),
            None => String::new(),
        };

        eprintln!(
            "  {} {}{}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            device_type,
            vid_pid,
            product,
            answer
        );
    }

    if let Ok(auto_port) = auto_detect_port(None) {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }
    Ok(())
}

/// List allow-listed USB devices and mark those in Meadow bootloader mode.
pub(crate) fn cmd_dfu_list(json: bool) -> Result<()> {
    let mut context = DfuContext::init().context("Failed to initialize USB")?;
    let handles = context.list_candidates()?;
    let devices: Vec<UsbDeviceInfo> = handles
        .iter()
        .map(|h| h.info().clone())
        .collect();
    drop(handles);
    context.dispose()?;

    if json {
        return print_json(&devices);
    }

    eprintln!("{}", style("DFU devices").bold().underlined());
    if devices.is_empty() {
        eprintln!("  {}", style("No devices found").dim());
    }
    for device in &devices {
        let kind = if device.is_meadow {
            style("[Meadow]").yellow().to_string()
        } else {
            style("(not a Meadow)").dim().to_string()
        };
        eprintln!(
            "  {} {} serial {} {}",
            style("•").green(),
            style(device.identity).cyan(),
            device
                .serial_number
                .as_deref()
                .unwrap_or("?"),
            kind
        );
    }
    Ok(())
}
