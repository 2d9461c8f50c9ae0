// Copyright 2025 NebulaStream
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::Result;
use crate::rpc::{dispatch, ControlReply, ControlRequest, ControlService};

/// Bind the control-plane endpoint and serve requests until the task is
/// aborted. Returns the bound address (useful with port 0) and the accept
/// task handle.
pub async fn serve_control(
    bind_addr: &str,
    service: Arc<dyn ControlService>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "control connection accepted");
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        if let Err(error) = handle_connection(stream, service).await {
                            tracing::warn!(%peer, %error, "control connection closed with error");
                        }
                    });
                }
                Err(error) => {
                    tracing::warn!(%error, "control accept failed");
                    return;
                }
            }
        }
    });
    Ok((local_addr, handle))
}

async fn handle_connection(stream: TcpStream, service: Arc<dyn ControlService>) -> Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let reply = match serde_json::from_slice::<ControlRequest>(&frame) {
            Ok(request) => {
                // Handlers may block (reconfiguration barriers); keep them off
                // the reactor.
                let service = Arc::clone(&service);
                tokio::task::spawn_blocking(move || dispatch(&*service, request))
                    .await
                    .unwrap_or_else(|_| ControlReply::failure("handler panicked"))
            }
            Err(error) => ControlReply::failure(format!("malformed request: {error}")),
        };
        let encoded = serde_json::to_vec(&reply)?;
        framed.send(encoded.into()).await?;
    }
    Ok(())
}
