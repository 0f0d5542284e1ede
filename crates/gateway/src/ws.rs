use std::{net::SocketAddr, sync::Arc};

use {
    async_trait::async_trait,
    axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code},
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    tracing::warn,
    uuid::Uuid,
};

use crate::{
    connections::{StreamReader, StreamWriter},
    error::GatewayError,
    state::GatewayState,
};

pub struct WsWriter(SplitSink<WebSocket, Message>);

#[async_trait]
impl StreamWriter for WsWriter {
    async fn write_text(&mut self, text: String) -> anyhow::Result<()> {
        self.0.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
    }
}

pub struct WsReader(SplitStream<WebSocket>);

#[async_trait]
impl StreamReader for WsReader {
    async fn read_frame(&mut self) -> anyhow::Result<()> {
        match self.0.next().await {
            Some(Ok(Message::Close(_))) | None => anyhow::bail!("closed by peer"),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(_)) => Ok(()),
        }
    }
}

async fn reject(mut socket: WebSocket, peer: SocketAddr, error: &GatewayError) {
    warn!(addr = %peer, error = %error, "rejecting stream");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static("rejected"),
        })))
        .await;
}

/// Drive an upgraded socket: redeem the ticket named by the raw query,
/// subscribe, and hand the halves to the connection registry.
pub async fn handle_stream(
    socket: WebSocket,
    state: Arc<GatewayState>,
    peer: SocketAddr,
    query: Option<String>,
) {
    let ticket = match query.as_deref().map(Uuid::parse_str) {
        Some(Ok(id)) => id,
        _ => {
            let error = GatewayError::BadRequest(format!("bad ticket query {query:?}"));
            return reject(socket, peer, &error).await;
        },
    };
    let redeemed = match state.tickets.consume(ticket, peer).await {
        Ok(redeemed) => redeemed,
        Err(e) => return reject(socket, peer, &e).await,
    };
    let subscription = match state.broker.subscribe(&redeemed.channel).await {
        Ok(subscription) => subscription,
        Err(e) => return reject(socket, peer, &e.into()).await,
    };

    let (sink, stream) = socket.split();
    state
        .connections
        .register(
            peer,
            redeemed.channel,
            redeemed.principal,
            WsWriter(sink),
            WsReader(stream),
            subscription,
        )
        .await;
}
