//! Subcommand implementations.

use klippy_bridge::{
    BridgeEvent, ChannelSink, Error as BridgeError, KlippyBridge, ObjectRequest, StatusPayload,
};
use serde_json::{Map, Value};
use tokio::{signal, sync::broadcast::error::RecvError};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

/// Keep the bridge up and log its events until Ctrl-C.
pub async fn run(bridge: &KlippyBridge) -> Result<()> {
    let mut events = bridge.events();
    bridge.start()?;
    info!(socket = %bridge.config().socket_path.display(), "waiting for Klippy");
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            ev = events.recv() => match ev {
                Ok(ev) => log_event(&ev),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event log fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    info!("shutting down");
    bridge.close(true).await;
    Ok(())
}

/// Log one bridge event at a level matching its weight.
fn log_event(ev: &BridgeEvent) {
    match ev {
        BridgeEvent::Identified(info) => info!(
            state = %info.state,
            version = info.software_version.as_deref().unwrap_or("unknown"),
            hostname = info.hostname.as_deref().unwrap_or("unknown"),
            "identified"
        ),
        BridgeEvent::Started { state } => info!(%state, "Klippy started"),
        BridgeEvent::Ready => info!("ready"),
        BridgeEvent::Shutdown => warn!("Klippy shutdown"),
        BridgeEvent::Disconnected => info!("disconnected"),
        BridgeEvent::GcodeResponse(text) => info!(target: "moonbridge::gcode", "{text}"),
        BridgeEvent::StatusUpdate(p) => trace!(eventtime = p.eventtime, "status update"),
    }
}

/// Wait for the handshake; a degraded host still serves requests.
async fn ready(bridge: &KlippyBridge) -> Result<()> {
    loop {
        bridge.connect().await?;
        match bridge.wait_ready().await {
            Ok(()) => return Ok(()),
            Err(BridgeError::NotReady(message)) => {
                warn!("continuing with Klippy not ready: {message}");
                return Ok(());
            }
            Err(BridgeError::Disconnected) => debug!("lost connection during handshake"),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Issue one request and print its result as JSON.
pub async fn call(bridge: &KlippyBridge, method: &str, params: Option<&str>) -> Result<()> {
    let params = parse_params(params)?;
    ready(bridge).await?;
    let res = bridge.request(method, params).await;
    bridge.close(true).await;
    println!("{}", serde_json::to_string_pretty(&res?)?);
    Ok(())
}

/// Subscribe to `specs` and print each update, re-subscribing after every
/// reconnect.
pub async fn watch(bridge: &KlippyBridge, specs: &[String]) -> Result<()> {
    let mut request = ObjectRequest::new();
    for spec in specs {
        request = add_watch_spec(request, spec)?;
    }
    let (sink, mut updates) = ChannelSink::new();
    let mut events = bridge.events();

    'connection: loop {
        tokio::select! {
            _ = signal::ctrl_c() => break 'connection,
            r = ready(bridge) => r?,
        }
        match bridge.subscribe(sink.clone(), request.clone()).await {
            Ok(snapshot) => print_status(&snapshot)?,
            Err(e) if e.is_disconnect() => continue,
            Err(e) => return Err(e.into()),
        }
        loop {
            tokio::select! {
                _ = signal::ctrl_c() => break 'connection,
                Some(update) = updates.recv() => print_status(&update)?,
                ev = events.recv() => match ev {
                    Ok(BridgeEvent::Disconnected) => {
                        info!("disconnected; waiting to re-subscribe");
                        continue 'connection;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break 'connection,
                },
            }
        }
    }
    bridge.close(true).await;
    Ok(())
}

/// Print one status payload as a single JSON line.
fn print_status(update: &StatusPayload) -> Result<()> {
    println!("{}", serde_json::to_string(update)?);
    Ok(())
}

/// Parse the optional JSON params argument; it must be an object.
pub fn parse_params(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::InvalidArgument("params must be a JSON object".into())),
        Err(e) => Err(Error::InvalidArgument(format!("params are not valid JSON: {e}"))),
    }
}

/// Add `object` or `object:field,field` to `request`.
pub fn add_watch_spec(request: ObjectRequest, spec: &str) -> Result<ObjectRequest> {
    let (object, fields) = match spec.split_once(':') {
        Some((object, fields)) => (object.trim(), Some(fields)),
        None => (spec.trim(), None),
    };
    if object.is_empty() {
        return Err(Error::InvalidArgument(format!("empty object name in '{spec}'")));
    }
    Ok(match fields {
        None => request.with_all(object),
        Some(fields) => request.with_fields(
            object,
            fields.split(',').map(str::trim).filter(|f| !f.is_empty()),
        ),
    })
}
