//! Stream unsolicited device output.

use {
    super::Ctx,
    anyhow::{Result, bail},
    console::style,
    log::debug,
    meadow_hcom::{DeviceMessage, Session},
    std::time::Duration,
};

const CLOSED_POLL: Duration = Duration::from_millis(200);

pub(crate) async fn cmd_listen(ctx: &Ctx) -> Result<()> {
    let session = ctx.open_session(|message| match message {
        DeviceMessage::Unsolicited(response) => match response.text() {
            Some(text) => println!("{text}"),
            None => debug!(
                "{:?}: {} bytes",
                response.response_type(),
                response
                    .payload()
                    .len()
            ),
        },
        DeviceMessage::Malformed(err) => debug!("Discarded frame: {err}"),
    })?;
    ctx.status(style("Listening, press Ctrl-C to stop").dim());

    tokio::select! {
        () = ctx.cancel.cancelled() => Ok(()),
        () = wait_closed(&session) => bail!("Device disconnected"),
    }
}

async fn wait_closed(session: &Session) {
    while session.is_open() {
        tokio::time::sleep(CLOSED_POLL).await;
    }
}
