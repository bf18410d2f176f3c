//! Alert delivery transports.

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const ALERT_SUBJECT: &str = "Alert: Hardhat Missing!";

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("building message: {0}")]
    Build(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("evidence I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("evidence encoding: {0}")]
    Encode(#[from] image::ImageError),
}

/// One fully prepared alert.
#[derive(Debug, Clone)]
pub struct AlertMessage {
    pub alert_id: Uuid,
    pub receiver: String,
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
    pub jpeg: Vec<u8>,
}

/// Delivers an alert to its receiver. Runs on the notification worker
/// thread, so implementations may block.
pub trait AlertTransport: Send {
    fn name(&self) -> &'static str;
    fn deliver(&self, message: &AlertMessage) -> Result<(), DeliveryError>;
}

/// Email over SMTP with STARTTLS.
pub struct SmtpAlertTransport {
    mailer: SmtpTransport,
    sender: Mailbox,
}

impl SmtpAlertTransport {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> Result<Self, DeliveryError> {
        let sender: Mailbox = user
            .parse()
            .map_err(|e| DeliveryError::Build(format!("sender address {user:?}: {e}")))?;
        let mailer = SmtpTransport::starttls_relay(host)
            .map_err(|e| DeliveryError::Transport(format!("relay {host}: {e}")))?
            .port(port)
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .timeout(Some(SMTP_TIMEOUT))
            .build();
        tracing::info!(host, port, sender = %sender, "SMTP transport configured");
        Ok(Self { mailer, sender })
    }

    fn build(&self, message: &AlertMessage) -> Result<Message, DeliveryError> {
        let to: Mailbox = message
            .receiver
            .parse()
            .map_err(|e| DeliveryError::Build(format!("receiver address {:?}: {e}", message.receiver)))?;
        let jpeg_type = ContentType::parse("image/jpeg")
            .map_err(|e| DeliveryError::Build(e.to_string()))?;

        Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(message.subject.clone())
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(message.body.clone()))
                    .singlepart(
                        Attachment::new(message.attachment_name.clone())
                            .body(message.jpeg.clone(), jpeg_type),
                    ),
            )
            .map_err(|e| DeliveryError::Build(e.to_string()))
    }
}

impl AlertTransport for SmtpAlertTransport {
    fn name(&self) -> &'static str {
        "smtp"
    }

    fn deliver(&self, message: &AlertMessage) -> Result<(), DeliveryError> {
        let email = self.build(message)?;
        self.mailer
            .send(&email)
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Logs alerts instead of sending them. Used when no SMTP credentials are set.
pub struct LogTransport;

impl AlertTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver(&self, message: &AlertMessage) -> Result<(), DeliveryError> {
        tracing::info!(
            alert_id = %message.alert_id,
            receiver = %message.receiver,
            subject = %message.subject,
            attachment = %message.attachment_name,
            bytes = message.jpeg.len(),
            "alert (log transport, not sent)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(receiver: &str) -> AlertMessage {
        AlertMessage {
            alert_id: Uuid::new_v4(),
            receiver: receiver.into(),
            subject: ALERT_SUBJECT.into(),
            body: "body".into(),
            attachment_name: "no_hardhat.jpg".into(),
            jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
        }
    }

    #[test]
    fn test_log_transport_always_succeeds() {
        assert!(LogTransport.deliver(&message("anyone@example.com")).is_ok());
    }

    #[test]
    fn test_smtp_rejects_bad_sender() {
        assert!(matches!(
            SmtpAlertTransport::new("smtp.example.com", 587, "not an address", "pw"),
            Err(DeliveryError::Build(_))
        ));
    }

    #[test]
    fn test_smtp_builds_message_with_attachment() {
        let transport =
            SmtpAlertTransport::new("smtp.example.com", 587, "cam@example.com", "pw").unwrap();
        let email = transport.build(&message("boss@example.com")).unwrap();
        let raw = String::from_utf8_lossy(&email.formatted()).into_owned();
        assert!(raw.contains("Subject: Alert: Hardhat Missing!"));
        assert!(raw.contains("no_hardhat.jpg"));
        assert!(raw.contains("image/jpeg"));
    }

    #[test]
    fn test_smtp_rejects_bad_receiver() {
        let transport =
            SmtpAlertTransport::new("smtp.example.com", 587, "cam@example.com", "pw").unwrap();
        assert!(matches!(
            transport.build(&message("nobody")),
            Err(DeliveryError::Build(_))
        ));
    }
}
