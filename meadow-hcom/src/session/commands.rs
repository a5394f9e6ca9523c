//! Typed device commands built on [`Session::send`].

use {
    super::Session,
    crate::{
        device_info::DeviceInfo,
        error::{Error, Result, TransportError},
        file_data::FileData,
        protocol::{Request, RequestType, ResponseType, SerialResponse},
    },
    log::{debug, warn},
    std::time::Duration,
};

/// Formatting the flash file system takes a while on larger parts.
const FORMAT_TIMEOUT: Duration = Duration::from_secs(120);

/// Writing the runtime image to flash.
const RUNTIME_FLASH_TIMEOUT: Duration = Duration::from_secs(300);

/// Listings end with a text-concluded frame.
const LIST_TIMEOUT: Duration = Duration::from_secs(30);

impl Session {
    /// Query and parse the device information text.
    pub async fn device_info(&self) -> Result<DeviceInfo> {
        match self
            .command(Request::get_device_info())
            .await?
        {
            SerialResponse::DeviceInfo(message) => Ok(DeviceInfo::from_text(&message.text())),
            other => Err(unexpected(&other)),
        }
    }

    /// Query the device name.
    pub async fn device_name(&self) -> Result<String> {
        let response = self
            .command(Request::new(RequestType::GetDeviceName))
            .await?;
        response
            .text()
            .ok_or_else(|| unexpected(&response))
    }

    /// Set the firmware trace level.
    pub async fn set_trace_level(&self, level: u32) -> Result<()> {
        self.command(Request::set_trace_level(level))
            .await?;
        Ok(())
    }

    /// Turn trace forwarding to the host on or off.
    pub async fn set_trace_to_host(&self, enabled: bool) -> Result<()> {
        let kind = if enabled {
            RequestType::SendTraceToHost
        } else {
            RequestType::NoTraceToHost
        };
        self.command(Request::new(kind))
            .await?;
        Ok(())
    }

    /// Turn trace forwarding to the debug UART on or off.
    pub async fn set_trace_to_uart(&self, enabled: bool) -> Result<()> {
        let kind = if enabled {
            RequestType::SendTraceToUart
        } else {
            RequestType::NoTraceToUart
        };
        self.command(Request::new(kind))
            .await?;
        Ok(())
    }

    /// Enable or disable the managed runtime at boot.
    pub async fn set_runtime_enabled(&self, enabled: bool) -> Result<()> {
        let kind = if enabled {
            RequestType::MonoEnable
        } else {
            RequestType::MonoDisable
        };
        self.command(Request::new(kind))
            .await?;
        Ok(())
    }

    /// Whether the managed runtime is enabled.
    pub async fn runtime_enabled(&self) -> Result<bool> {
        let response = self
            .command(Request::new(RequestType::MonoRunState))
            .await?;
        let text = response
            .text()
            .ok_or_else(|| unexpected(&response))?
            .to_ascii_lowercase();
        Ok(text.contains("enabled") && !text.contains("disabled"))
    }

    /// Restart the primary MCU.
    pub async fn restart(&self) -> Result<()> {
        self.command_before_reset(Request::new(RequestType::RestartPrimaryMcu))
            .await
    }

    /// Reboot into the USB DFU bootloader.
    pub async fn enter_dfu_mode(&self) -> Result<()> {
        self.command_before_reset(Request::new(RequestType::EnterDfuMode))
            .await
    }

    /// Names of the files on the flash partition.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let replies = self
            .list(RequestType::ListPartitionFiles)
            .await?;
        Ok(replies
            .iter()
            .filter(|r| r.response_type() == ResponseType::TextListMember)
            .filter_map(SerialResponse::text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect())
    }

    /// Files on the flash partition with size and CRC.
    ///
    /// Lines that do not parse are skipped with a warning.
    pub async fn list_files_with_crc(&self) -> Result<Vec<FileData>> {
        let replies = self
            .list(RequestType::ListPartitionFilesAndCrc)
            .await?;
        Ok(replies
            .iter()
            .filter(|r| {
                matches!(
                    r.response_type(),
                    ResponseType::TextCrcMember | ResponseType::TextListMember
                )
            })
            .filter_map(SerialResponse::text)
            .filter_map(|line| {
                let parsed = FileData::try_parse(&line);
                if parsed.is_none() {
                    warn!("Skipping unparsable listing line: {line:?}");
                }
                parsed
            })
            .collect())
    }

    /// Delete a file from the flash partition.
    pub async fn delete_file(&self, name: &str) -> Result<()> {
        self.command(Request::delete_file(name))
            .await?;
        Ok(())
    }

    /// Erase and re-format the flash file system.
    pub async fn format_file_system(&self) -> Result<()> {
        self.command_with_timeout(
            Request::new(RequestType::FormatFlashFileSystem),
            FORMAT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Flash a previously uploaded runtime image.
    pub async fn flash_runtime(&self) -> Result<()> {
        self.command_with_timeout(Request::new(RequestType::MonoFlash), RUNTIME_FLASH_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Forward debugger protocol bytes; returns the device's answer.
    pub async fn send_debugger_data(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let response = self
            .command(Request::debugger_data(data))
            .await?;
        Ok(response.into_payload())
    }

    async fn command(&self, request: Request) -> Result<SerialResponse> {
        self.command_with_timeout(request, self.config.request_timeout)
            .await
    }

    async fn command_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<SerialResponse> {
        let response = self
            .send(request, timeout)
            .await?;
        reject_check(response)
    }

    /// The device may reset before its acknowledgement gets out.
    async fn command_before_reset(&self, request: Request) -> Result<()> {
        let kind = request.kind();
        match self
            .send(request, self.config.request_timeout)
            .await
        {
            Ok(response) => reject_check(response).map(|_| ()),
            Err(TransportError::Timeout(_) | TransportError::PortClosed) => {
                debug!("{kind:?}: device reset before acknowledging");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, kind: RequestType) -> Result<Vec<SerialResponse>> {
        let replies = self
            .send_collect(Request::new(kind), LIST_TIMEOUT, |r| {
                r.is_rejected() || r.response_type() == ResponseType::TextConcluded
            })
            .await?;
        if let Some(rejected) = replies
            .iter()
            .find(|r| r.is_rejected())
        {
            return Err(Error::DeviceRejected(
                rejected
                    .text()
                    .unwrap_or_default(),
            ));
        }
        Ok(replies)
    }
}

fn reject_check(response: SerialResponse) -> Result<SerialResponse> {
    match response {
        SerialResponse::TextRejected(message) => Err(Error::DeviceRejected(message.text())),
        other => Ok(other),
    }
}

fn unexpected(response: &SerialResponse) -> Error {
    Error::UnexpectedResponse(format!("{:?}", response.response_type()))
}
