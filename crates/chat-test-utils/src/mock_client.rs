//! Mock TCP chat client.
//!
//! Speaks either codec over a real TCP connection. All receives go through
//! a timeout so a missing frame fails the test instead of hanging it.

use std::time::Duration;

use bytes::BytesMut;
use chat_protocol::{
    ChatMessage, MessageKind, ProtocolKind, ServerResponse, WireProtocol,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MockChatClient {
    stream: TcpStream,
    buffer: BytesMut,
    protocol: Box<dyn WireProtocol>,
}

impl MockChatClient {
    pub async fn connect(
        addr: &str,
        protocol: ProtocolKind,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            protocol: protocol.create(),
        })
    }

    pub async fn send(&mut self, msg: &ChatMessage) -> Result<(), Box<dyn std::error::Error>> {
        let encoded = self.protocol.encode_message(msg)?;
        self.stream.write_all(&encoded).await?;
        Ok(())
    }

    /// Write arbitrary bytes, bypassing the codec. For corruption tests.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Receive the next response frame, waiting up to five seconds.
    pub async fn recv_response(&mut self) -> Result<ServerResponse, Box<dyn std::error::Error>> {
        tokio::time::timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .map_err(|_| "timed out waiting for a response frame")?
    }

    /// True if the server closed the connection without another frame.
    pub async fn recv_eof(&mut self) -> Result<bool, Box<dyn std::error::Error>> {
        loop {
            if let Some(frame) = self.protocol.extract_frame(&mut self.buffer)? {
                // A stray frame means not EOF; surface it for debugging.
                let response = self.protocol.decode_response(&frame)?;
                return Err(format!("expected EOF, got response: {response:?}").into());
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(RECV_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .map_err(|_| "timed out waiting for EOF")??;
            if n == 0 {
                return Ok(true);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn recv_inner(&mut self) -> Result<ServerResponse, Box<dyn std::error::Error>> {
        loop {
            if let Some(frame) = self.protocol.extract_frame(&mut self.buffer)? {
                return Ok(self.protocol.decode_response(&frame)?);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err("connection closed by server".into());
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    // -----------------------------------------------------------------------
    // Scenario conveniences
    // -----------------------------------------------------------------------

    pub async fn register(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<ServerResponse, Box<dyn std::error::Error>> {
        self.send(
            &ChatMessage::new(MessageKind::Register, username, "").with_password(password),
        )
        .await?;
        self.recv_response().await
    }

    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<ServerResponse, Box<dyn std::error::Error>> {
        self.send(&ChatMessage::new(MessageKind::Login, username, "").with_password(password))
            .await?;
        self.recv_response().await
    }

    pub async fn dm(
        &mut self,
        sender: &str,
        recipient: &str,
        content: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send(
            &ChatMessage::new(MessageKind::Dm, sender, content)
                .with_recipients(vec![recipient.to_owned()]),
        )
        .await
    }

    pub async fn logout(&mut self, username: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.send(&ChatMessage::new(MessageKind::Logout, username, ""))
            .await
    }

    /// Drain responses until one satisfies `pred`, failing on timeout.
    /// Useful when broadcasts interleave with the reply under test.
    pub async fn recv_until(
        &mut self,
        mut pred: impl FnMut(&ServerResponse) -> bool,
    ) -> Result<ServerResponse, Box<dyn std::error::Error>> {
        loop {
            let response = self.recv_response().await?;
            if pred(&response) {
                return Ok(response);
            }
        }
    }
}
