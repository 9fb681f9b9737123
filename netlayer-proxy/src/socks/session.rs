//! One SOCKS server session: greeting, request, connect, then relay

use crate::error::{LayerError, Result, SocksError};
use crate::layer::{BoxedStream, Layer, Options, TargetAddr};
use crate::socks::protocol::*;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Drive a session over `client` until the relay ends or negotiation fails.
///
/// A failure is returned after the matching reply, if any, was sent; the
/// caller closes the client by dropping it.
pub async fn run<S>(mut client: S, lower: Arc<dyn Layer>, options: &Options) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_version(&mut client).await? {
        SOCKS5_VERSION => socks5(client, lower, options).await,
        SOCKS4_VERSION => socks4(client, lower, options).await,
        other => Err(SocksError::UnsupportedVersion(other).into()),
    }
}

async fn send<S: AsyncWrite + Unpin>(client: &mut S, bytes: &[u8]) -> Result<()> {
    client.write_all(bytes).await?;
    client.flush().await?;
    Ok(())
}

fn connect_failed(target: &TargetAddr, err: LayerError) -> LayerError {
    SocksError::ConnectFailed {
        target: target.to_string(),
        kind: err.io_kind(),
        message: err.to_string(),
    }
    .into()
}

async fn socks5<S>(mut client: S, lower: Arc<dyn Layer>, options: &Options) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let methods = read_socks5_methods(&mut client).await?;
    debug!("SOCKS5 greeting offers methods {:?}", methods);
    if !methods.contains(&METHOD_NO_AUTH) {
        send(&mut client, &[SOCKS5_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(SocksError::NoAcceptableMethod.into());
    }
    send(&mut client, &[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;

    let header = read_socks5_header(&mut client).await?;
    if header.command != CMD_CONNECT {
        send(&mut client, &socks5_reply(REP_COMMAND_NOT_SUPPORTED, None)).await?;
        return Err(SocksError::UnsupportedCommand(header.command).into());
    }

    let target = match read_socks5_target(&mut client, header.address_type).await {
        Ok(target) => target,
        Err(err @ SocksError::UnsupportedAddressType(_)) => {
            send(&mut client, &socks5_reply(REP_ADDRESS_TYPE_NOT_SUPPORTED, None)).await?;
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };
    debug!("SOCKS5 CONNECT {} via {}", target, lower.name());

    match lower.connect(options, None, &target).await {
        Ok(downstream) => {
            send(&mut client, &socks5_reply(REP_SUCCEEDED, Some(&target))).await?;
            relay(&mut client, downstream, &target).await
        }
        Err(err) => {
            let code = socks5_failure_code(err.io_kind());
            debug!("SOCKS5 connect to {} failed ({:#04x}): {}", target, code, err);
            send(&mut client, &socks5_reply(code, Some(&target))).await?;
            Err(connect_failed(&target, err))
        }
    }
}

async fn socks4<S>(mut client: S, lower: Arc<dyn Layer>, options: &Options) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_socks4_request(&mut client).await?;
    let rejected = socks4_reply(SOCKS4_REJECTED, request.port, request.ip);

    if request.command != CMD_CONNECT {
        send(&mut client, &rejected).await?;
        return Err(SocksError::UnsupportedCommand(request.command).into());
    }
    debug!("SOCKS4 CONNECT {} via {}", request.target, lower.name());

    match lower.connect(options, None, &request.target).await {
        Ok(downstream) => {
            send(
                &mut client,
                &socks4_reply(SOCKS4_GRANTED, request.port, request.ip),
            )
            .await?;
            relay(&mut client, downstream, &request.target).await
        }
        Err(err) => {
            debug!("SOCKS4 connect to {} failed: {}", request.target, err);
            send(&mut client, &rejected).await?;
            Err(connect_failed(&request.target, err))
        }
    }
}

async fn relay<S>(client: &mut S, downstream: BoxedStream, target: &TargetAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!("SOCKS relay established to {}", target);
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut down_rd, mut down_wr) = tokio::io::split(downstream);

    // The first direction to finish ends the session for both sides
    let (side, copied) = tokio::select! {
        up = tokio::io::copy(&mut client_rd, &mut down_wr) => ("client", up),
        down = tokio::io::copy(&mut down_rd, &mut client_wr) => ("target", down),
    };
    match copied {
        Ok(bytes) => debug!(
            "SOCKS relay to {} finished by the {} side after {} bytes",
            target, side, bytes
        ),
        Err(e) => debug!("SOCKS relay to {} ended on the {} side: {}", target, side, e),
    }

    let _ = down_wr.shutdown().await;
    let _ = client_wr.shutdown().await;
    Ok(())
}
