//! Single-request device commands.

use {
    super::{Ctx, print_json},
    anyhow::Result,
    clap::ValueEnum,
    console::style,
};

/// On/off switch argument.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub(crate) enum Toggle {
    On,
    Off,
}

/// `runtime` subcommand action.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub(crate) enum RuntimeAction {
    Enable,
    Disable,
    Status,
}

pub(crate) async fn cmd_info(ctx: &Ctx, json: bool) -> Result<()> {
    let session = ctx.connect()?;
    let info = session
        .device_info()
        .await?;

    if json {
        return print_json(&info);
    }
    for (key, value) in &info.properties {
        println!("{key}: {value}");
    }
    Ok(())
}

pub(crate) async fn cmd_files(ctx: &Ctx, crc: bool, json: bool) -> Result<()> {
    let session = ctx.connect()?;

    if crc {
        let files = session
            .list_files_with_crc()
            .await?;
        if json {
            return print_json(&files);
        }
        for file in &files {
            println!("{file}");
        }
    } else {
        let names = session
            .list_files()
            .await?;
        if json {
            return print_json(&names);
        }
        for name in &names {
            println!("{name}");
        }
    }
    Ok(())
}

pub(crate) async fn cmd_delete(ctx: &Ctx, name: &str) -> Result<()> {
    ctx.connect()?
        .delete_file(name)
        .await?;
    ctx.status(format!("{} Deleted {name}", style("✓").green()));
    Ok(())
}

pub(crate) async fn cmd_trace(ctx: &Ctx, level: u32) -> Result<()> {
    ctx.connect()?
        .set_trace_level(level)
        .await?;
    ctx.status(format!("{} Trace level set to {level}", style("✓").green()));
    Ok(())
}

pub(crate) async fn cmd_trace_host(ctx: &Ctx, state: Toggle) -> Result<()> {
    let enabled = matches!(state, Toggle::On);
    ctx.connect()?
        .set_trace_to_host(enabled)
        .await?;
    ctx.status(format!(
        "{} Trace to host {}",
        style("✓").green(),
        if enabled { "on" } else { "off" }
    ));
    Ok(())
}

pub(crate) async fn cmd_runtime(ctx: &Ctx, action: RuntimeAction) -> Result<()> {
    let session = ctx.connect()?;
    match action {
        RuntimeAction::Enable | RuntimeAction::Disable => {
            let enable = matches!(action, RuntimeAction::Enable);
            session
                .set_runtime_enabled(enable)
                .await?;
            ctx.status(format!(
                "{} Runtime {}",
                style("✓").green(),
                if enable { "enabled" } else { "disabled" }
            ));
        },
        RuntimeAction::Status => {
            let enabled = session
                .runtime_enabled()
                .await?;
            println!("{}", if enabled { "enabled" } else { "disabled" });
        },
    }
    Ok(())
}

pub(crate) async fn cmd_restart(ctx: &Ctx) -> Result<()> {
    ctx.connect()?
        .restart()
        .await?;
    ctx.status(format!("{} Restarting", style("🔄").cyan()));
    Ok(())
}

pub(crate) async fn cmd_enter_dfu(ctx: &Ctx) -> Result<()> {
    ctx.connect()?
        .enter_dfu_mode()
        .await?;
    ctx.status(format!(
        "{} Rebooting into DFU bootloader; run `meadow dfu-list` to see it",
        style("🔄").cyan()
    ));
    Ok(())
}
