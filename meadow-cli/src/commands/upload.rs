//! File upload with a progress bar.

use {
    super::Ctx,
    crate::use_fancy_output,
    anyhow::{Context, Result, bail},
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    meadow_hcom::{TransferTarget, transfer},
    std::path::Path,
};

pub(crate) async fn cmd_upload(
    ctx: &Ctx,
    file: &Path,
    dest: Option<&str>,
    esp: Option<u32>,
) -> Result<()> {
    if !file.is_file() {
        bail!("File not found: {}", file.display());
    }
    let destination = match dest {
        Some(dest) => dest.to_string(),
        None => file
            .file_name()
            .map(|name| {
                name.to_string_lossy()
                    .into_owned()
            })
            .context("Cannot derive a device file name; pass --dest")?,
    };

    let mut config = ctx.transfer_config();
    if let Some(flash_address) = esp {
        config = config.with_target(TransferTarget::Esp32 { flash_address });
    }

    let session = ctx.connect()?;

    let pb = if ctx.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(0);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.set_message(destination.clone());
        pb
    };

    let result = transfer(
        &session,
        file,
        &destination,
        &config,
        &ctx.cancel,
        &mut |sent, total| {
            pb.set_length(total);
            pb.set_position(sent);
        },
    )
    .await;

    match result {
        Ok(result) => {
            pb.finish_and_clear();
            ctx.status(format!(
                "{} Uploaded {destination}: {result}",
                style("✓").green()
            ));
            Ok(())
        },
        Err(e) => {
            pb.abandon();
            Err(e.into())
        },
    }
}
