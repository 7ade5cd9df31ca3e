//! Handlers run on the engine task for methods that change connection or
//! session state

use std::{process, sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    connection::{engine::Outgoing, engine::Tuning, BrokerDetails, ConnectionInner},
    constants::{
        ACCESS_REFUSED, CONNECTION_CHANNEL, DEFAULT_CHANNEL_MAX, DEFAULT_SEGMENTED_MAX_FRAME_SIZE,
        MIN_MAX_FRAME_SIZE,
    },
    framing::{FieldTable, FieldValue, Method, MethodKind, ProtocolEvent, ProtocolVersion},
    session,
    state::ConnectionState,
    util::Running,
    Error,
};

use super::Handler;

pub(crate) fn table() -> Vec<(MethodKind, Handler)> {
    vec![
        (MethodKind::ConnectionStart, on_start as Handler),
        (MethodKind::ConnectionSecure, on_secure),
        (MethodKind::ConnectionTune, on_tune),
        (MethodKind::ConnectionOpenOk, on_open_ok),
        (MethodKind::ConnectionRedirect, on_redirect),
        (MethodKind::ConnectionClose, on_close),
        (MethodKind::ConnectionCloseOk, on_close_ok),
        (MethodKind::ChannelClose, on_channel_close),
        (MethodKind::ChannelFlow, on_channel_flow),
        (MethodKind::ChannelFlowOk, on_channel_flow_ok),
        (MethodKind::SessionDetached, on_session_detached),
        (MethodKind::BasicDeliver, on_deliver),
        (MethodKind::BasicReturn, on_return),
        (MethodKind::BasicCancel, on_cancel),
    ]
}

fn expect_state(
    connection: &ConnectionInner,
    expected: ConnectionState,
    kind: MethodKind,
) -> Result<(), Error> {
    let current = connection.state.current_state();
    match current == expected {
        true => Ok(()),
        false => Err(Error::Protocol(format!(
            "{} received in state {}, expected {}",
            kind, current, expected
        ))),
    }
}

fn unexpected(event: &ProtocolEvent) -> Error {
    Error::Protocol(format!(
        "handler does not accept {}",
        event.method.kind()
    ))
}

fn write(connection: &ConnectionInner, channel: u16, method: Method, flush: bool) -> Result<(), Error> {
    connection.write(ProtocolEvent::new(channel, method), flush)
}

/* -------------------------------------------------------------------------- */
/*                                  Handshake                                 */
/* -------------------------------------------------------------------------- */

/// Picks the version to continue with given what the broker reports
///
/// A 0-9 report on a connection that asked for 0-9-1 is treated as 0-9-1.
fn reconcile_version(
    requested: ProtocolVersion,
    major: u8,
    minor: u8,
    accept_broker_version: bool,
    segmented: bool,
) -> Result<ProtocolVersion, Error> {
    match ProtocolVersion::from_numbers(major, minor) {
        Some(ProtocolVersion::V0_9) if requested == ProtocolVersion::V0_9_1 => {
            Ok(ProtocolVersion::V0_9_1)
        }
        Some(version) => Ok(version),
        None if accept_broker_version => match segmented {
            true => Ok(ProtocolVersion::V0_10),
            false => Ok(ProtocolVersion::V0_9_1),
        },
        None => Err(Error::ProtocolVersionMismatch { major, minor }),
    }
}

fn client_properties(connection: &ConnectionInner) -> FieldTable {
    let mut properties = FieldTable::new();
    properties.insert("product".into(), FieldValue::from(env!("CARGO_PKG_NAME")));
    properties.insert("version".into(), FieldValue::from(env!("CARGO_PKG_VERSION")));
    properties.insert(
        "platform".into(),
        FieldValue::from(format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)),
    );
    let process_name = std::env::args()
        .next()
        .unwrap_or_default();
    properties.insert("process".into(), FieldValue::from(process_name));
    properties.insert("pid".into(), FieldValue::LongInt(process::id() as i32));
    if !connection.settings.client_id.is_empty() {
        properties.insert(
            "client_id".into(),
            FieldValue::from(connection.settings.client_id.clone()),
        );
    }
    properties
}

fn on_start(connection: &Arc<ConnectionInner>, event: &ProtocolEvent) -> Result<Running, Error> {
    expect_state(connection, ConnectionState::NotStarted, MethodKind::ConnectionStart)?;
    let Method::ConnectionStart {
        version_major,
        version_minor,
        server_properties,
        mechanisms,
        locales,
    } = &event.method
    else {
        return Err(unexpected(event));
    };

    let version = reconcile_version(
        connection.settings.protocol_version,
        *version_major,
        *version_minor,
        connection.settings.accept_broker_version,
        connection.version().is_segmented(),
    )?;
    info!(%version, "broker started connection");
    connection.set_version(version);
    connection.negotiated.lock().server_properties = server_properties.clone();

    let broker = connection
        .broker()
        .ok_or_else(|| Error::IllegalState("no broker for this attempt".into()))?;
    let offered = String::from_utf8_lossy(mechanisms);
    let profile = connection.settings.profile_for(&broker);
    let restriction = connection.settings.sasl_mechanisms_for(&broker);
    let mechanism = connection
        .sasl
        .select(&offered, restriction, profile)
        .ok_or_else(|| {
            Error::AuthenticationFailure(format!(
                "no usable mechanism among those offered: {}",
                offered
            ))
        })?;

    let locales = String::from_utf8_lossy(locales);
    let locale = locales
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::Protocol("broker offered no locale".into()))?
        .to_string();

    let mut client = mechanism.client(profile)?;
    let response = client.initial_response()?;
    let mechanism = client.mechanism().to_string();
    debug!(%mechanism, %locale, "starting SASL exchange");
    *connection.sasl_client.lock() = Some(client);

    let start_ok = Method::ConnectionStartOk {
        client_properties: client_properties(connection),
        mechanism,
        response,
        locale,
    };
    write(connection, CONNECTION_CHANNEL, start_ok, true)?;
    connection.state.change_state(ConnectionState::NotTuned);
    Ok(Running::Continue)
}

fn on_secure(connection: &Arc<ConnectionInner>, event: &ProtocolEvent) -> Result<Running, Error> {
    expect_state(connection, ConnectionState::NotTuned, MethodKind::ConnectionSecure)?;
    let Method::ConnectionSecure { challenge } = &event.method else {
        return Err(unexpected(event));
    };
    let response = {
        let mut client = connection.sasl_client.lock();
        let client = client
            .as_mut()
            .ok_or_else(|| Error::Protocol("connection.secure before connection.start".into()))?;
        client.evaluate_challenge(challenge)?
    };
    write(
        connection,
        CONNECTION_CHANNEL,
        Method::ConnectionSecureOk { response },
        true,
    )?;
    Ok(Running::Continue)
}

/// Server 0 means no limit on the broker side, client 0 means no limit on
/// the client side
fn negotiate_channel_max(server: u16, client: u16) -> u16 {
    let server = match server {
        0 => DEFAULT_CHANNEL_MAX,
        n => n,
    };
    match client {
        0 => server,
        n => server.min(n),
    }
}

/// 0 means unlimited on either side
fn negotiate_frame_max(server: u32, client: u32, segmented: bool) -> u32 {
    let negotiated = match (server, client) {
        (0, 0) => return if segmented { DEFAULT_SEGMENTED_MAX_FRAME_SIZE } else { 0 },
        (0, n) | (n, 0) => n,
        (s, c) => s.min(c),
    };
    let negotiated = negotiated.max(MIN_MAX_FRAME_SIZE);
    match segmented {
        true => negotiated.min(DEFAULT_SEGMENTED_MAX_FRAME_SIZE),
        false => negotiated,
    }
}

/// Heartbeat interval in seconds
///
/// Without a configured value the broker's maximum is used. A configured 0
/// disables heartbeats. A configured value within the broker's range is
/// kept, anything else falls back to the broker's maximum.
pub(crate) fn calculate_heartbeat_interval(configured: Option<u16>, min: u16, max: u16) -> u16 {
    match configured {
        None => max,
        Some(0) => 0,
        Some(value) if value >= min && (max == 0 || value <= max) => value,
        Some(value) => {
            debug!(value, min, max, "configured heartbeat outside broker range");
            max
        }
    }
}

fn on_tune(connection: &Arc<ConnectionInner>, event: &ProtocolEvent) -> Result<Running, Error> {
    expect_state(connection, ConnectionState::NotTuned, MethodKind::ConnectionTune)?;
    let Method::ConnectionTune {
        channel_max,
        frame_max,
        heartbeat_min,
        heartbeat_max,
    } = &event.method
    else {
        return Err(unexpected(event));
    };

    let complete = connection
        .sasl_client
        .lock()
        .as_ref()
        .map(|client| client.is_complete())
        .unwrap_or(false);
    if !complete {
        return Err(Error::AuthenticationFailure(
            "connection.tune before the SASL exchange completed".into(),
        ));
    }

    let broker = connection
        .broker()
        .ok_or_else(|| Error::IllegalState("no broker for this attempt".into()))?;
    let version = connection.version();
    let settings = &connection.settings;

    let channel_max = negotiate_channel_max(*channel_max, settings.channel_max);
    let frame_max = negotiate_frame_max(
        *frame_max,
        settings.max_frame_size_for(version),
        version.is_segmented(),
    );
    let heartbeat = calculate_heartbeat_interval(
        settings.heartbeat_for(&broker),
        *heartbeat_min,
        *heartbeat_max,
    );
    info!(channel_max, frame_max, heartbeat, "connection tuned");

    {
        let mut negotiated = connection.negotiated.lock();
        negotiated.channel_max = channel_max;
        negotiated.frame_max = frame_max;
        negotiated.heartbeat = heartbeat;
    }

    let tune_ok = Method::ConnectionTuneOk {
        channel_max,
        frame_max,
        heartbeat,
    };
    write(connection, CONNECTION_CHANNEL, tune_ok, false)?;

    let period = match heartbeat {
        0 => None,
        secs => Some(Duration::from_secs(secs as u64)),
    };
    let idle_timeout = period.map(|period| period.mul_f32(settings.heartbeat_timeout_factor));
    connection.send(Outgoing::Reconfigure(Tuning {
        max_frame_size: frame_max,
        heartbeat: period,
        idle_timeout,
    }))?;

    let open = Method::ConnectionOpen {
        virtual_host: settings.virtual_host_for(&broker).to_string(),
        insist: false,
    };
    write(connection, CONNECTION_CHANNEL, open, true)?;
    connection.state.change_state(ConnectionState::NotOpened);
    Ok(Running::Continue)
}

fn on_open_ok(connection: &Arc<ConnectionInner>, event: &ProtocolEvent) -> Result<Running, Error> {
    expect_state(connection, ConnectionState::NotOpened, MethodKind::ConnectionOpenOk)?;
    let Method::ConnectionOpenOk { known_hosts } = &event.method else {
        return Err(unexpected(event));
    };
    let known_hosts = BrokerDetails::parse_host_list(known_hosts);
    if !known_hosts.is_empty() {
        debug!(count = known_hosts.len(), "broker advertised known hosts");
    }
    connection.negotiated.lock().known_hosts = known_hosts;
    connection.state.change_state(ConnectionState::Open);
    Ok(Running::Continue)
}

fn on_redirect(connection: &Arc<ConnectionInner>, event: &ProtocolEvent) -> Result<Running, Error> {
    let Method::ConnectionRedirect { host, known_hosts } = &event.method else {
        return Err(unexpected(event));
    };
    let known_hosts: Vec<String> = known_hosts
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect();
    info!(%host, ?known_hosts, "broker redirected connection");
    connection
        .failover
        .set_pending_redirect(host.clone(), known_hosts.clone());
    Err(Error::Redirect {
        host: host.clone(),
        known_hosts,
    })
}

fn on_close(connection: &Arc<ConnectionInner>, event: &ProtocolEvent) -> Result<Running, Error> {
    let Method::ConnectionClose {
        reply_code,
        reply_text,
        class_id,
        method_id,
    } = &event.method
    else {
        return Err(unexpected(event));
    };
    warn!(
        reply_code,
        %reply_text,
        class_id,
        method_id,
        "broker closed connection"
    );
    let before_open = matches!(
        connection.state.current_state(),
        ConnectionState::NotStarted | ConnectionState::NotTuned | ConnectionState::NotOpened
    );
    write(connection, CONNECTION_CHANNEL, Method::ConnectionCloseOk, true)?;
    match before_open && *reply_code == ACCESS_REFUSED {
        true => Err(Error::AuthenticationFailure(reply_text.clone())),
        false => Err(Error::ConnectionClosedByPeer {
            reply_code: *reply_code,
            reply_text: reply_text.clone(),
        }),
    }
}

fn on_close_ok(connection: &Arc<ConnectionInner>, _event: &ProtocolEvent) -> Result<Running, Error> {
    connection.state.change_state(ConnectionState::Closed);
    Ok(Running::Stop)
}

/* -------------------------------------------------------------------------- */
/*                                  Channels                                  */
/* -------------------------------------------------------------------------- */

fn on_channel_close(
    connection: &Arc<ConnectionInner>,
    event: &ProtocolEvent,
) -> Result<Running, Error> {
    let Method::ChannelClose {
        reply_code,
        reply_text,
        ..
    } = &event.method
    else {
        return Err(unexpected(event));
    };
    let channel = event.channel;
    warn!(channel, reply_code, %reply_text, "broker closed channel");
    write(connection, channel, Method::ChannelCloseOk, true)?;
    if let Some(session) = connection.session(channel) {
        session.mark_closed(Error::ChannelClosedByPeer {
            channel,
            reply_code: *reply_code,
            reply_text: reply_text.clone(),
        });
    }
    connection.release_session(channel);
    Ok(Running::Continue)
}

fn on_channel_flow(
    connection: &Arc<ConnectionInner>,
    event: &ProtocolEvent,
) -> Result<Running, Error> {
    let Method::ChannelFlow { active } = &event.method else {
        return Err(unexpected(event));
    };
    if let Some(session) = connection.session(event.channel) {
        session.set_flow(*active);
    }
    write(
        connection,
        event.channel,
        Method::ChannelFlowOk { active: *active },
        true,
    )?;
    Ok(Running::Continue)
}

fn on_channel_flow_ok(
    connection: &Arc<ConnectionInner>,
    event: &ProtocolEvent,
) -> Result<Running, Error> {
    let Method::ChannelFlowOk { active } = &event.method else {
        return Err(unexpected(event));
    };
    if let Some(session) = connection.session(event.channel) {
        session.set_suspended(!*active);
    }
    Ok(Running::Continue)
}

fn on_session_detached(
    connection: &Arc<ConnectionInner>,
    event: &ProtocolEvent,
) -> Result<Running, Error> {
    let Method::SessionDetached { name, code } = &event.method else {
        return Err(unexpected(event));
    };
    let reason = format!(
        "session {} detached with code {}",
        String::from_utf8_lossy(name),
        code
    );
    warn!(channel = event.channel, %reason, "broker detached session");
    if let Some(session) = connection.session(event.channel) {
        session.mark_closed(Error::SessionDetached(reason));
    }
    connection.release_session(event.channel);
    Ok(Running::Continue)
}

/* -------------------------------------------------------------------------- */
/*                                  Deliveries                                */
/* -------------------------------------------------------------------------- */

fn on_deliver(connection: &Arc<ConnectionInner>, event: &ProtocolEvent) -> Result<Running, Error> {
    match connection.session(event.channel) {
        Some(session) => {
            if session.on_deliver(event)? {
                session::on_high_water_mark(connection, &session);
            }
        }
        None => warn!(channel = event.channel, "delivery on unknown channel"),
    }
    Ok(Running::Continue)
}

fn on_return(connection: &Arc<ConnectionInner>, event: &ProtocolEvent) -> Result<Running, Error> {
    let Method::BasicReturn {
        reply_code,
        reply_text,
        exchange,
        routing_key,
    } = &event.method
    else {
        return Err(unexpected(event));
    };
    debug!(channel = event.channel, reply_code, %reply_text, "message returned");
    connection.report_exception(&Error::MessageReturned {
        reply_code: *reply_code,
        reply_text: reply_text.clone(),
        exchange: exchange.clone(),
        routing_key: routing_key.clone(),
    });
    Ok(Running::Continue)
}

fn on_cancel(connection: &Arc<ConnectionInner>, event: &ProtocolEvent) -> Result<Running, Error> {
    let Method::BasicCancel {
        consumer_tag,
        no_wait,
    } = &event.method
    else {
        return Err(unexpected(event));
    };
    info!(channel = event.channel, consumer = %consumer_tag, "broker cancelled consumer");
    if let Some(session) = connection.session(event.channel) {
        if let Some(consumer) = session.remove_consumer(consumer_tag) {
            consumer.mark_closed();
        }
    }
    if !*no_wait {
        let cancel_ok = Method::BasicCancelOk {
            consumer_tag: consumer_tag.clone(),
        };
        write(connection, event.channel, cancel_ok, true)?;
    }
    Ok(Running::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_reporting_0_9_on_a_0_9_1_connection_stays_0_9_1() {
        let version = reconcile_version(ProtocolVersion::V0_9_1, 0, 9, false, false).unwrap();
        assert_eq!(version, ProtocolVersion::V0_9_1);

        let version = reconcile_version(ProtocolVersion::V0_9, 0, 9, false, false).unwrap();
        assert_eq!(version, ProtocolVersion::V0_9);
    }

    #[test]
    fn unknown_version_needs_accept_broker_version() {
        assert!(matches!(
            reconcile_version(ProtocolVersion::V0_9_1, 7, 7, false, false),
            Err(Error::ProtocolVersionMismatch { major: 7, minor: 7 })
        ));
        assert_eq!(
            reconcile_version(ProtocolVersion::V0_9_1, 7, 7, true, false).unwrap(),
            ProtocolVersion::V0_9_1
        );
        assert_eq!(
            reconcile_version(ProtocolVersion::V0_10, 7, 7, true, true).unwrap(),
            ProtocolVersion::V0_10
        );
    }

    #[test]
    fn channel_max_clamps() {
        assert_eq!(negotiate_channel_max(0, 0), u16::MAX);
        assert_eq!(negotiate_channel_max(0, 10), 10);
        assert_eq!(negotiate_channel_max(256, 0), 256);
        assert_eq!(negotiate_channel_max(256, 1), 1);
    }

    #[test]
    fn frame_max_clamps() {
        assert_eq!(negotiate_frame_max(0, 0, false), 0);
        assert_eq!(negotiate_frame_max(131_072, 0, false), 131_072);
        assert_eq!(negotiate_frame_max(131_072, 65_536, false), 65_536);
        assert_eq!(negotiate_frame_max(1024, 131_072, false), MIN_MAX_FRAME_SIZE);
        assert_eq!(
            negotiate_frame_max(131_072, 131_072, true),
            DEFAULT_SEGMENTED_MAX_FRAME_SIZE
        );
    }

    #[test]
    fn heartbeat_interval() {
        assert_eq!(calculate_heartbeat_interval(None, 0, 60), 60);
        assert_eq!(calculate_heartbeat_interval(Some(0), 5, 60), 0);
        assert_eq!(calculate_heartbeat_interval(Some(30), 5, 60), 30);
        assert_eq!(calculate_heartbeat_interval(Some(2), 5, 60), 60);
        assert_eq!(calculate_heartbeat_interval(Some(90), 5, 60), 60);
        assert_eq!(calculate_heartbeat_interval(Some(90), 0, 0), 90);
    }

    #[test]
    fn every_handler_is_registered_once() {
        let table = table();
        let mut kinds: Vec<_> = table.iter().map(|(kind, _)| *kind).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), table.len());
    }
}
