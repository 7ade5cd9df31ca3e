//! Method catalogue and argument encoding

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    field::{
        bit, pack_bits, read_long_bytes, read_short_str, read_table, read_u16, read_u32, read_u64,
        read_u8, write_long_bytes, write_short_str, write_table,
    },
    segment::SegmentType,
    Error, FieldTable,
};

macro_rules! method_kinds {
    ($($kind:ident = ($class:literal, $method:literal, $name:literal)),* $(,)?) => {
        /// Identifies a method by class and method id
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[allow(missing_docs)]
        pub enum MethodKind {
            $($kind),*
        }

        impl MethodKind {
            /// Class id on the wire
            pub fn class_id(&self) -> u16 {
                match self {
                    $(Self::$kind => $class),*
                }
            }

            /// Method id on the wire
            pub fn method_id(&self) -> u16 {
                match self {
                    $(Self::$kind => $method),*
                }
            }

            /// Dotted protocol name, eg. `basic.deliver`
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$kind => $name),*
                }
            }

            /// Looks up a method by its wire ids
            pub fn from_ids(class_id: u16, method_id: u16) -> Option<Self> {
                match (class_id, method_id) {
                    $(($class, $method) => Some(Self::$kind),)*
                    _ => None,
                }
            }
        }
    };
}

method_kinds! {
    ConnectionStart = (10, 10, "connection.start"),
    ConnectionStartOk = (10, 11, "connection.start-ok"),
    ConnectionSecure = (10, 20, "connection.secure"),
    ConnectionSecureOk = (10, 21, "connection.secure-ok"),
    ConnectionTune = (10, 30, "connection.tune"),
    ConnectionTuneOk = (10, 31, "connection.tune-ok"),
    ConnectionOpen = (10, 40, "connection.open"),
    ConnectionOpenOk = (10, 41, "connection.open-ok"),
    ConnectionRedirect = (10, 42, "connection.redirect"),
    ConnectionClose = (10, 50, "connection.close"),
    ConnectionCloseOk = (10, 51, "connection.close-ok"),
    ConnectionHeartbeat = (10, 70, "connection.heartbeat"),
    SessionAttach = (2, 1, "session.attach"),
    SessionAttached = (2, 2, "session.attached"),
    SessionDetached = (2, 4, "session.detached"),
    ChannelOpen = (20, 10, "channel.open"),
    ChannelOpenOk = (20, 11, "channel.open-ok"),
    ChannelFlow = (20, 20, "channel.flow"),
    ChannelFlowOk = (20, 21, "channel.flow-ok"),
    ChannelClose = (20, 40, "channel.close"),
    ChannelCloseOk = (20, 41, "channel.close-ok"),
    QueueDeclare = (50, 10, "queue.declare"),
    QueueDeclareOk = (50, 11, "queue.declare-ok"),
    QueueBind = (50, 20, "queue.bind"),
    QueueBindOk = (50, 21, "queue.bind-ok"),
    QueueUnbind = (50, 50, "queue.unbind"),
    QueueUnbindOk = (50, 51, "queue.unbind-ok"),
    BasicQos = (60, 10, "basic.qos"),
    BasicQosOk = (60, 11, "basic.qos-ok"),
    BasicConsume = (60, 20, "basic.consume"),
    BasicConsumeOk = (60, 21, "basic.consume-ok"),
    BasicCancel = (60, 30, "basic.cancel"),
    BasicCancelOk = (60, 31, "basic.cancel-ok"),
    BasicPublish = (60, 40, "basic.publish"),
    BasicReturn = (60, 50, "basic.return"),
    BasicDeliver = (60, 60, "basic.deliver"),
    BasicAck = (60, 80, "basic.ack"),
    BasicReject = (60, 90, "basic.reject"),
    BasicRecoverSyncOk = (60, 101, "basic.recover-sync-ok"),
    BasicRecoverSync = (60, 102, "basic.recover-sync"),
    BasicRecover = (60, 110, "basic.recover"),
    BasicRecoverOk = (60, 111, "basic.recover-ok"),
    TxSelect = (90, 10, "tx.select"),
    TxSelectOk = (90, 11, "tx.select-ok"),
    TxCommit = (90, 20, "tx.commit"),
    TxCommitOk = (90, 21, "tx.commit-ok"),
    TxRollback = (90, 30, "tx.rollback"),
    TxRollbackOk = (90, 31, "tx.rollback-ok"),
}

impl MethodKind {
    /// Whether the method is followed by a content header and body
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            Self::BasicPublish | Self::BasicReturn | Self::BasicDeliver
        )
    }

    /// Segment type used to carry this method in 0-10 framing
    pub fn segment_type(&self) -> SegmentType {
        match self.class_id() {
            2 | 10 => SegmentType::Control,
            _ => SegmentType::Command,
        }
    }
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How method arguments are laid out
///
/// The layouts differ only in `connection.tune`, which carries a single
/// heartbeat in legacy framing and a min/max pair in segmented framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentLayout {
    /// 0-8, 0-9 and 0-9-1
    Legacy,
    /// 0-10
    Segmented,
}

/// A protocol method with its arguments
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: Bytes,
        locales: Bytes,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Bytes,
        locale: String,
    },
    ConnectionSecure {
        challenge: Bytes,
    },
    ConnectionSecureOk {
        response: Bytes,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat_min: u16,
        heartbeat_max: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
        insist: bool,
    },
    ConnectionOpenOk {
        known_hosts: String,
    },
    ConnectionRedirect {
        host: String,
        known_hosts: String,
    },
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,
    ConnectionHeartbeat,
    SessionAttach {
        name: Bytes,
        force: bool,
    },
    SessionAttached {
        name: Bytes,
    },
    SessionDetached {
        name: Bytes,
        code: u8,
    },
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,
    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,
    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicReturn {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicRecover {
        requeue: bool,
    },
    BasicRecoverOk,
    BasicRecoverSync {
        requeue: bool,
    },
    BasicRecoverSyncOk,
    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,
}

impl Method {
    /// The kind of this method
    pub fn kind(&self) -> MethodKind {
        match self {
            Self::ConnectionStart { .. } => MethodKind::ConnectionStart,
            Self::ConnectionStartOk { .. } => MethodKind::ConnectionStartOk,
            Self::ConnectionSecure { .. } => MethodKind::ConnectionSecure,
            Self::ConnectionSecureOk { .. } => MethodKind::ConnectionSecureOk,
            Self::ConnectionTune { .. } => MethodKind::ConnectionTune,
            Self::ConnectionTuneOk { .. } => MethodKind::ConnectionTuneOk,
            Self::ConnectionOpen { .. } => MethodKind::ConnectionOpen,
            Self::ConnectionOpenOk { .. } => MethodKind::ConnectionOpenOk,
            Self::ConnectionRedirect { .. } => MethodKind::ConnectionRedirect,
            Self::ConnectionClose { .. } => MethodKind::ConnectionClose,
            Self::ConnectionCloseOk => MethodKind::ConnectionCloseOk,
            Self::ConnectionHeartbeat => MethodKind::ConnectionHeartbeat,
            Self::SessionAttach { .. } => MethodKind::SessionAttach,
            Self::SessionAttached { .. } => MethodKind::SessionAttached,
            Self::SessionDetached { .. } => MethodKind::SessionDetached,
            Self::ChannelOpen => MethodKind::ChannelOpen,
            Self::ChannelOpenOk => MethodKind::ChannelOpenOk,
            Self::ChannelFlow { .. } => MethodKind::ChannelFlow,
            Self::ChannelFlowOk { .. } => MethodKind::ChannelFlowOk,
            Self::ChannelClose { .. } => MethodKind::ChannelClose,
            Self::ChannelCloseOk => MethodKind::ChannelCloseOk,
            Self::QueueDeclare { .. } => MethodKind::QueueDeclare,
            Self::QueueDeclareOk { .. } => MethodKind::QueueDeclareOk,
            Self::QueueBind { .. } => MethodKind::QueueBind,
            Self::QueueBindOk => MethodKind::QueueBindOk,
            Self::QueueUnbind { .. } => MethodKind::QueueUnbind,
            Self::QueueUnbindOk => MethodKind::QueueUnbindOk,
            Self::BasicQos { .. } => MethodKind::BasicQos,
            Self::BasicQosOk => MethodKind::BasicQosOk,
            Self::BasicConsume { .. } => MethodKind::BasicConsume,
            Self::BasicConsumeOk { .. } => MethodKind::BasicConsumeOk,
            Self::BasicCancel { .. } => MethodKind::BasicCancel,
            Self::BasicCancelOk { .. } => MethodKind::BasicCancelOk,
            Self::BasicPublish { .. } => MethodKind::BasicPublish,
            Self::BasicReturn { .. } => MethodKind::BasicReturn,
            Self::BasicDeliver { .. } => MethodKind::BasicDeliver,
            Self::BasicAck { .. } => MethodKind::BasicAck,
            Self::BasicReject { .. } => MethodKind::BasicReject,
            Self::BasicRecover { .. } => MethodKind::BasicRecover,
            Self::BasicRecoverOk => MethodKind::BasicRecoverOk,
            Self::BasicRecoverSync { .. } => MethodKind::BasicRecoverSync,
            Self::BasicRecoverSyncOk => MethodKind::BasicRecoverSyncOk,
            Self::TxSelect => MethodKind::TxSelect,
            Self::TxSelectOk => MethodKind::TxSelectOk,
            Self::TxCommit => MethodKind::TxCommit,
            Self::TxCommitOk => MethodKind::TxCommitOk,
            Self::TxRollback => MethodKind::TxRollback,
            Self::TxRollbackOk => MethodKind::TxRollbackOk,
        }
    }

    /// Encodes class id, method id and arguments
    pub fn encode(&self, dst: &mut BytesMut, layout: ArgumentLayout) -> Result<(), Error> {
        let kind = self.kind();
        dst.put_u16(kind.class_id());
        dst.put_u16(kind.method_id());
        self.encode_arguments(dst, layout)
    }

    fn encode_arguments(&self, dst: &mut BytesMut, layout: ArgumentLayout) -> Result<(), Error> {
        match self {
            Self::ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                dst.put_u8(*version_major);
                dst.put_u8(*version_minor);
                write_table(dst, server_properties)?;
                write_long_bytes(dst, mechanisms)?;
                write_long_bytes(dst, locales)?;
            }
            Self::ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                write_table(dst, client_properties)?;
                write_short_str(dst, mechanism)?;
                write_long_bytes(dst, response)?;
                write_short_str(dst, locale)?;
            }
            Self::ConnectionSecure { challenge } => write_long_bytes(dst, challenge)?,
            Self::ConnectionSecureOk { response } => write_long_bytes(dst, response)?,
            Self::ConnectionTune {
                channel_max,
                frame_max,
                heartbeat_min,
                heartbeat_max,
            } => {
                dst.put_u16(*channel_max);
                dst.put_u32(*frame_max);
                if layout == ArgumentLayout::Segmented {
                    dst.put_u16(*heartbeat_min);
                }
                dst.put_u16(*heartbeat_max);
            }
            Self::ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                dst.put_u16(*channel_max);
                dst.put_u32(*frame_max);
                dst.put_u16(*heartbeat);
            }
            Self::ConnectionOpen {
                virtual_host,
                insist,
            } => {
                write_short_str(dst, virtual_host)?;
                write_short_str(dst, "")?;
                dst.put_u8(pack_bits(&[*insist]));
            }
            Self::ConnectionOpenOk { known_hosts } => write_short_str(dst, known_hosts)?,
            Self::ConnectionRedirect { host, known_hosts } => {
                write_short_str(dst, host)?;
                write_short_str(dst, known_hosts)?;
            }
            Self::ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | Self::ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                dst.put_u16(*reply_code);
                write_short_str(dst, reply_text)?;
                dst.put_u16(*class_id);
                dst.put_u16(*method_id);
            }
            Self::SessionAttach { name, force } => {
                write_long_bytes(dst, name)?;
                dst.put_u8(pack_bits(&[*force]));
            }
            Self::SessionAttached { name } => write_long_bytes(dst, name)?,
            Self::SessionDetached { name, code } => {
                write_long_bytes(dst, name)?;
                dst.put_u8(*code);
            }
            Self::ChannelOpen => write_short_str(dst, "")?,
            Self::ChannelOpenOk => write_long_bytes(dst, b"")?,
            Self::ChannelFlow { active } | Self::ChannelFlowOk { active } => {
                dst.put_u8(pack_bits(&[*active]))
            }
            Self::QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => {
                dst.put_u16(0);
                write_short_str(dst, queue)?;
                dst.put_u8(pack_bits(&[
                    *passive,
                    *durable,
                    *exclusive,
                    *auto_delete,
                    *no_wait,
                ]));
                write_table(dst, arguments)?;
            }
            Self::QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => {
                write_short_str(dst, queue)?;
                dst.put_u32(*message_count);
                dst.put_u32(*consumer_count);
            }
            Self::QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
                arguments,
            } => {
                dst.put_u16(0);
                write_short_str(dst, queue)?;
                write_short_str(dst, exchange)?;
                write_short_str(dst, routing_key)?;
                dst.put_u8(pack_bits(&[*no_wait]));
                write_table(dst, arguments)?;
            }
            Self::QueueUnbind {
                queue,
                exchange,
                routing_key,
                arguments,
            } => {
                dst.put_u16(0);
                write_short_str(dst, queue)?;
                write_short_str(dst, exchange)?;
                write_short_str(dst, routing_key)?;
                write_table(dst, arguments)?;
            }
            Self::BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            } => {
                dst.put_u32(*prefetch_size);
                dst.put_u16(*prefetch_count);
                dst.put_u8(pack_bits(&[*global]));
            }
            Self::BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments,
            } => {
                dst.put_u16(0);
                write_short_str(dst, queue)?;
                write_short_str(dst, consumer_tag)?;
                dst.put_u8(pack_bits(&[*no_local, *no_ack, *exclusive, *no_wait]));
                write_table(dst, arguments)?;
            }
            Self::BasicConsumeOk { consumer_tag } | Self::BasicCancelOk { consumer_tag } => {
                write_short_str(dst, consumer_tag)?
            }
            Self::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                write_short_str(dst, consumer_tag)?;
                dst.put_u8(pack_bits(&[*no_wait]));
            }
            Self::BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                dst.put_u16(0);
                write_short_str(dst, exchange)?;
                write_short_str(dst, routing_key)?;
                dst.put_u8(pack_bits(&[*mandatory, *immediate]));
            }
            Self::BasicReturn {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            } => {
                dst.put_u16(*reply_code);
                write_short_str(dst, reply_text)?;
                write_short_str(dst, exchange)?;
                write_short_str(dst, routing_key)?;
            }
            Self::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                write_short_str(dst, consumer_tag)?;
                dst.put_u64(*delivery_tag);
                dst.put_u8(pack_bits(&[*redelivered]));
                write_short_str(dst, exchange)?;
                write_short_str(dst, routing_key)?;
            }
            Self::BasicAck {
                delivery_tag,
                multiple,
            } => {
                dst.put_u64(*delivery_tag);
                dst.put_u8(pack_bits(&[*multiple]));
            }
            Self::BasicReject {
                delivery_tag,
                requeue,
            } => {
                dst.put_u64(*delivery_tag);
                dst.put_u8(pack_bits(&[*requeue]));
            }
            Self::BasicRecover { requeue } | Self::BasicRecoverSync { requeue } => {
                dst.put_u8(pack_bits(&[*requeue]))
            }
            Self::ConnectionCloseOk
            | Self::ConnectionHeartbeat
            | Self::ChannelCloseOk
            | Self::QueueBindOk
            | Self::QueueUnbindOk
            | Self::BasicQosOk
            | Self::BasicRecoverOk
            | Self::BasicRecoverSyncOk
            | Self::TxSelect
            | Self::TxSelectOk
            | Self::TxCommit
            | Self::TxCommitOk
            | Self::TxRollback
            | Self::TxRollbackOk => {}
        }
        Ok(())
    }

    /// Decodes a method, including its class and method ids
    pub fn decode(src: &mut Bytes, layout: ArgumentLayout) -> Result<Self, Error> {
        let class_id = read_u16(src)?;
        let method_id = read_u16(src)?;
        let kind = MethodKind::from_ids(class_id, method_id)
            .ok_or(Error::UnknownMethod { class_id, method_id })?;
        Self::decode_arguments(kind, src, layout)
    }

    fn decode_arguments(
        kind: MethodKind,
        src: &mut Bytes,
        layout: ArgumentLayout,
    ) -> Result<Self, Error> {
        let method = match kind {
            MethodKind::ConnectionStart => Self::ConnectionStart {
                version_major: read_u8(src)?,
                version_minor: read_u8(src)?,
                server_properties: read_table(src)?,
                mechanisms: read_long_bytes(src)?,
                locales: read_long_bytes(src)?,
            },
            MethodKind::ConnectionStartOk => Self::ConnectionStartOk {
                client_properties: read_table(src)?,
                mechanism: read_short_str(src)?,
                response: read_long_bytes(src)?,
                locale: read_short_str(src)?,
            },
            MethodKind::ConnectionSecure => Self::ConnectionSecure {
                challenge: read_long_bytes(src)?,
            },
            MethodKind::ConnectionSecureOk => Self::ConnectionSecureOk {
                response: read_long_bytes(src)?,
            },
            MethodKind::ConnectionTune => {
                let channel_max = read_u16(src)?;
                let frame_max = read_u32(src)?;
                let heartbeat_min = match layout {
                    ArgumentLayout::Legacy => 0,
                    ArgumentLayout::Segmented => read_u16(src)?,
                };
                let heartbeat_max = read_u16(src)?;
                Self::ConnectionTune {
                    channel_max,
                    frame_max,
                    heartbeat_min,
                    heartbeat_max,
                }
            }
            MethodKind::ConnectionTuneOk => Self::ConnectionTuneOk {
                channel_max: read_u16(src)?,
                frame_max: read_u32(src)?,
                heartbeat: read_u16(src)?,
            },
            MethodKind::ConnectionOpen => {
                let virtual_host = read_short_str(src)?;
                let _capabilities = read_short_str(src)?;
                let bits = read_u8(src)?;
                Self::ConnectionOpen {
                    virtual_host,
                    insist: bit(bits, 0),
                }
            }
            MethodKind::ConnectionOpenOk => Self::ConnectionOpenOk {
                known_hosts: read_short_str(src)?,
            },
            MethodKind::ConnectionRedirect => Self::ConnectionRedirect {
                host: read_short_str(src)?,
                known_hosts: read_short_str(src)?,
            },
            MethodKind::ConnectionClose => Self::ConnectionClose {
                reply_code: read_u16(src)?,
                reply_text: read_short_str(src)?,
                class_id: read_u16(src)?,
                method_id: read_u16(src)?,
            },
            MethodKind::ConnectionCloseOk => Self::ConnectionCloseOk,
            MethodKind::ConnectionHeartbeat => Self::ConnectionHeartbeat,
            MethodKind::SessionAttach => {
                let name = read_long_bytes(src)?;
                let bits = read_u8(src)?;
                Self::SessionAttach {
                    name,
                    force: bit(bits, 0),
                }
            }
            MethodKind::SessionAttached => Self::SessionAttached {
                name: read_long_bytes(src)?,
            },
            MethodKind::SessionDetached => Self::SessionDetached {
                name: read_long_bytes(src)?,
                code: read_u8(src)?,
            },
            MethodKind::ChannelOpen => {
                let _out_of_band = read_short_str(src)?;
                Self::ChannelOpen
            }
            MethodKind::ChannelOpenOk => {
                let _channel_id = read_long_bytes(src)?;
                Self::ChannelOpenOk
            }
            MethodKind::ChannelFlow => Self::ChannelFlow {
                active: bit(read_u8(src)?, 0),
            },
            MethodKind::ChannelFlowOk => Self::ChannelFlowOk {
                active: bit(read_u8(src)?, 0),
            },
            MethodKind::ChannelClose => Self::ChannelClose {
                reply_code: read_u16(src)?,
                reply_text: read_short_str(src)?,
                class_id: read_u16(src)?,
                method_id: read_u16(src)?,
            },
            MethodKind::ChannelCloseOk => Self::ChannelCloseOk,
            MethodKind::QueueDeclare => {
                let _ticket = read_u16(src)?;
                let queue = read_short_str(src)?;
                let bits = read_u8(src)?;
                Self::QueueDeclare {
                    queue,
                    passive: bit(bits, 0),
                    durable: bit(bits, 1),
                    exclusive: bit(bits, 2),
                    auto_delete: bit(bits, 3),
                    no_wait: bit(bits, 4),
                    arguments: read_table(src)?,
                }
            }
            MethodKind::QueueDeclareOk => Self::QueueDeclareOk {
                queue: read_short_str(src)?,
                message_count: read_u32(src)?,
                consumer_count: read_u32(src)?,
            },
            MethodKind::QueueBind => {
                let _ticket = read_u16(src)?;
                let queue = read_short_str(src)?;
                let exchange = read_short_str(src)?;
                let routing_key = read_short_str(src)?;
                let bits = read_u8(src)?;
                Self::QueueBind {
                    queue,
                    exchange,
                    routing_key,
                    no_wait: bit(bits, 0),
                    arguments: read_table(src)?,
                }
            }
            MethodKind::QueueBindOk => Self::QueueBindOk,
            MethodKind::QueueUnbind => {
                let _ticket = read_u16(src)?;
                Self::QueueUnbind {
                    queue: read_short_str(src)?,
                    exchange: read_short_str(src)?,
                    routing_key: read_short_str(src)?,
                    arguments: read_table(src)?,
                }
            }
            MethodKind::QueueUnbindOk => Self::QueueUnbindOk,
            MethodKind::BasicQos => {
                let prefetch_size = read_u32(src)?;
                let prefetch_count = read_u16(src)?;
                let bits = read_u8(src)?;
                Self::BasicQos {
                    prefetch_size,
                    prefetch_count,
                    global: bit(bits, 0),
                }
            }
            MethodKind::BasicQosOk => Self::BasicQosOk,
            MethodKind::BasicConsume => {
                let _ticket = read_u16(src)?;
                let queue = read_short_str(src)?;
                let consumer_tag = read_short_str(src)?;
                let bits = read_u8(src)?;
                Self::BasicConsume {
                    queue,
                    consumer_tag,
                    no_local: bit(bits, 0),
                    no_ack: bit(bits, 1),
                    exclusive: bit(bits, 2),
                    no_wait: bit(bits, 3),
                    arguments: read_table(src)?,
                }
            }
            MethodKind::BasicConsumeOk => Self::BasicConsumeOk {
                consumer_tag: read_short_str(src)?,
            },
            MethodKind::BasicCancel => {
                let consumer_tag = read_short_str(src)?;
                let bits = read_u8(src)?;
                Self::BasicCancel {
                    consumer_tag,
                    no_wait: bit(bits, 0),
                }
            }
            MethodKind::BasicCancelOk => Self::BasicCancelOk {
                consumer_tag: read_short_str(src)?,
            },
            MethodKind::BasicPublish => {
                let _ticket = read_u16(src)?;
                let exchange = read_short_str(src)?;
                let routing_key = read_short_str(src)?;
                let bits = read_u8(src)?;
                Self::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: bit(bits, 0),
                    immediate: bit(bits, 1),
                }
            }
            MethodKind::BasicReturn => Self::BasicReturn {
                reply_code: read_u16(src)?,
                reply_text: read_short_str(src)?,
                exchange: read_short_str(src)?,
                routing_key: read_short_str(src)?,
            },
            MethodKind::BasicDeliver => {
                let consumer_tag = read_short_str(src)?;
                let delivery_tag = read_u64(src)?;
                let bits = read_u8(src)?;
                Self::BasicDeliver {
                    consumer_tag,
                    delivery_tag,
                    redelivered: bit(bits, 0),
                    exchange: read_short_str(src)?,
                    routing_key: read_short_str(src)?,
                }
            }
            MethodKind::BasicAck => {
                let delivery_tag = read_u64(src)?;
                Self::BasicAck {
                    delivery_tag,
                    multiple: bit(read_u8(src)?, 0),
                }
            }
            MethodKind::BasicReject => {
                let delivery_tag = read_u64(src)?;
                Self::BasicReject {
                    delivery_tag,
                    requeue: bit(read_u8(src)?, 0),
                }
            }
            MethodKind::BasicRecover => Self::BasicRecover {
                requeue: bit(read_u8(src)?, 0),
            },
            MethodKind::BasicRecoverOk => Self::BasicRecoverOk,
            MethodKind::BasicRecoverSync => Self::BasicRecoverSync {
                requeue: bit(read_u8(src)?, 0),
            },
            MethodKind::BasicRecoverSyncOk => Self::BasicRecoverSyncOk,
            MethodKind::TxSelect => Self::TxSelect,
            MethodKind::TxSelectOk => Self::TxSelectOk,
            MethodKind::TxCommit => Self::TxCommit,
            MethodKind::TxCommitOk => Self::TxCommitOk,
            MethodKind::TxRollback => Self::TxRollback,
            MethodKind::TxRollbackOk => Self::TxRollbackOk,
        };
        Ok(method)
    }
}
