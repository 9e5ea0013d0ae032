//! Inbound packet handling

use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::{Client, ClientState};
use crate::codec::RawPacket;
use crate::error::{ClientError, Result};
use crate::protocol::{
    ConnAck, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck, UnsubAck,
};
use crate::store::{Direction, Message, MessageState, StoredMessage};

impl Client {
    /// Decode a framed packet and act on it
    pub(super) fn handle_packet(&mut self, raw: RawPacket) -> Result<()> {
        let packet = self.decoder.decode_body(raw.command, &raw.body)?;
        trace!(
            "Client {} received {} ({} bytes)",
            self.options.client_id,
            packet.name(),
            raw.remaining_length()
        );

        // Nothing but CONNACK may precede CONNACK
        if self.shared.state() == ClientState::Connecting && !matches!(packet, Packet::ConnAck(_))
        {
            return Err(ClientError::violation("packet received before CONNACK"));
        }

        match packet {
            Packet::ConnAck(connack) => self.handle_connack(connack),
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::PubAck(puback) => self.handle_puback(puback),
            Packet::PubRec(pubrec) => self.handle_pubrec(pubrec),
            Packet::PubRel(pubrel) => self.handle_pubrel(pubrel),
            Packet::PubComp(pubcomp) => self.handle_pubcomp(pubcomp),
            Packet::SubAck(suback) => self.handle_suback(suback),
            Packet::UnsubAck(unsuback) => self.handle_unsuback(unsuback),
            Packet::PingReq => {
                debug!("Client {} received PINGREQ", self.options.client_id);
                self.shared.queue(&Packet::PingResp, false)
            }
            Packet::PingResp => {
                debug!("Client {} received PINGRESP", self.options.client_id);
                self.ping_sent = None;
                Ok(())
            }
            Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::Disconnect => Err(ClientError::violation(
                "broker sent a client-only packet",
            )),
        }
    }

    fn handle_connack(&mut self, connack: ConnAck) -> Result<()> {
        debug!(
            "Client {} received CONNACK ({})",
            self.options.client_id,
            connack.return_code.as_u8()
        );

        match self.shared.state() {
            ClientState::Connecting => {}
            ClientState::Disconnecting => return Ok(()),
            _ => return Err(ClientError::violation("unexpected CONNACK")),
        }

        let code = connack.return_code;
        if code.is_accepted() {
            info!("Client {} connected", self.options.client_id);
            self.shared.set_state(ClientState::Connected);
            self.callback(|h, c| h.on_connect(c, code));
            Ok(())
        } else {
            info!("Client {} {}", self.options.client_id, code);
            self.callback(|h, c| h.on_connect(c, code));
            Err(ClientError::ConnectionRefused(code))
        }
    }

    fn handle_publish(&mut self, publish: Publish) -> Result<()> {
        debug!(
            "Client {} received PUBLISH (d{}, q{}, r{}, m{}, '{}', ... ({} bytes))",
            self.options.client_id,
            publish.dup as u8,
            publish.qos as u8,
            publish.retain as u8,
            publish.packet_id.unwrap_or(0),
            publish.topic,
            publish.payload.len()
        );

        let mid = publish.packet_id.unwrap_or(0);
        let message = Message::from_publish(publish);

        match message.qos {
            QoS::AtMostOnce => {
                self.callback(|h, c| h.on_message(c, &message));
            }
            QoS::AtLeastOnce => {
                self.shared.queue(&Packet::PubAck(PubAck::new(mid)), false)?;
                self.callback(|h, c| h.on_message(c, &message));
            }
            QoS::ExactlyOnce => {
                {
                    let mut store = self.shared.store.lock();
                    if !store.contains(mid, Direction::In) {
                        store.insert(StoredMessage::new(
                            message,
                            Direction::In,
                            MessageState::WaitPubRel,
                            Instant::now(),
                        ));
                    }
                }
                self.shared.queue(&Packet::PubRec(PubRec::new(mid)), false)?;
            }
        }
        Ok(())
    }

    fn handle_puback(&mut self, puback: PubAck) -> Result<()> {
        let mid = puback.packet_id;
        debug!("Client {} received PUBACK (Mid: {})", self.options.client_id, mid);

        let removed = self
            .shared
            .store
            .lock()
            .remove_in_state(mid, Direction::Out, MessageState::WaitPubAck);
        if removed.is_some() {
            self.callback(|h, c| h.on_publish(c, mid));
        }
        Ok(())
    }

    fn handle_pubrec(&mut self, pubrec: PubRec) -> Result<()> {
        let mid = pubrec.packet_id;
        debug!("Client {} received PUBREC (Mid: {})", self.options.client_id, mid);

        {
            let mut store = self.shared.store.lock();
            let waiting = store.get(mid, Direction::Out).map(|m| m.state);
            if matches!(
                waiting,
                Some(MessageState::WaitPubRec) | Some(MessageState::WaitPubComp)
            ) {
                store.update(mid, Direction::Out, MessageState::WaitPubComp, Instant::now());
            }
        }

        // The broker may be repeating PUBREC because our PUBREL was lost
        self.shared.queue(&Packet::PubRel(PubRel::new(mid)), false)
    }

    fn handle_pubrel(&mut self, pubrel: PubRel) -> Result<()> {
        let mid = pubrel.packet_id;
        debug!("Client {} received PUBREL (Mid: {})", self.options.client_id, mid);

        let stored = self.shared.store.lock().remove(mid, Direction::In);
        self.shared.queue(&Packet::PubComp(PubComp::new(mid)), false)?;

        if let Some(stored) = stored {
            self.callback(|h, c| h.on_message(c, &stored.msg));
        }
        Ok(())
    }

    fn handle_pubcomp(&mut self, pubcomp: PubComp) -> Result<()> {
        let mid = pubcomp.packet_id;
        debug!("Client {} received PUBCOMP (Mid: {})", self.options.client_id, mid);

        let removed = self
            .shared
            .store
            .lock()
            .remove_in_state(mid, Direction::Out, MessageState::WaitPubComp);
        if removed.is_some() {
            self.callback(|h, c| h.on_publish(c, mid));
        }
        Ok(())
    }

    fn handle_suback(&mut self, suback: SubAck) -> Result<()> {
        debug!(
            "Client {} received SUBACK (Mid: {})",
            self.options.client_id, suback.packet_id
        );
        self.callback(|h, c| h.on_subscribe(c, suback.packet_id, &suback.granted_qos));
        Ok(())
    }

    fn handle_unsuback(&mut self, unsuback: UnsubAck) -> Result<()> {
        debug!(
            "Client {} received UNSUBACK (Mid: {})",
            self.options.client_id, unsuback.packet_id
        );
        self.callback(|h, c| h.on_unsubscribe(c, unsuback.packet_id));
        Ok(())
    }
}
