//! Tagged frames exchanged with the feed node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named subscription topic multiplexed over one feed connection.
///
/// The set of channels is closed: each push-data frame type is statically
/// bound to exactly one channel (see [`ServerFrame::data_channel`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Live order-book snapshots.
    Orderbook,
    /// CLOB bid events.
    Bids,
    /// Auction bid events.
    AuctionBids,
}

impl Channel {
    /// The channel's wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Orderbook => "orderbook",
            Channel::Bids => "bids",
            Channel::AuctionBids => "auction_bids",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Requests a subscription on `channel`. `params` is forwarded opaquely.
    Subscribe {
        channel: Channel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },
    /// Tears down the subscription on `channel`.
    Unsubscribe { channel: Channel },
}

/// Frames pushed by the node.
///
/// Acknowledgments name the channel they answer. `error` frames carry no
/// channel at all; the protocol does not correlate them to a request.
/// Data frames carry their payload inline; the `type` tag alone decides
/// which channel they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A `subscribe` request was accepted.
    Subscribed { channel: Channel },
    /// An `unsubscribe` request was processed.
    Unsubscribed { channel: Channel },
    /// A channel-less server error.
    Error { message: String },
    /// Order-book data, delivered on [`Channel::Orderbook`].
    OrderbookSnapshot {
        #[serde(flatten)]
        payload: serde_json::Map<String, serde_json::Value>,
    },
    /// CLOB bid data, delivered on [`Channel::Bids`].
    ClobBidsAdded {
        #[serde(flatten)]
        payload: serde_json::Map<String, serde_json::Value>,
    },
    /// Auction bid data, delivered on [`Channel::AuctionBids`].
    AuctionBidsAdded {
        #[serde(flatten)]
        payload: serde_json::Map<String, serde_json::Value>,
    },
}

impl ServerFrame {
    /// The channel a data frame is delivered on, `None` for acks and errors.
    pub fn data_channel(&self) -> Option<Channel> {
        match self {
            ServerFrame::OrderbookSnapshot { .. } => Some(Channel::Orderbook),
            ServerFrame::ClobBidsAdded { .. } => Some(Channel::Bids),
            ServerFrame::AuctionBidsAdded { .. } => Some(Channel::AuctionBids),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_wire_names() {
        assert_eq!(
            serde_json::to_string(&Channel::AuctionBids).unwrap(),
            "\"auction_bids\""
        );
        let parsed: Channel = serde_json::from_str("\"orderbook\"").unwrap();
        assert_eq!(parsed, Channel::Orderbook);
        assert_eq!(Channel::Bids.to_string(), "bids");
    }

    #[test]
    fn subscribe_frame_omits_missing_params() {
        let frame = ClientFrame::Subscribe {
            channel: Channel::Orderbook,
            params: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "subscribe", "channel": "orderbook"})
        );
    }

    #[test]
    fn subscribe_frame_carries_params() {
        let frame = ClientFrame::Subscribe {
            channel: Channel::Bids,
            params: Some(serde_json::json!({"clob_ids": ["0xabc"]})),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["channel"], "bids");
        assert_eq!(json["params"]["clob_ids"][0], "0xabc");
    }

    #[test]
    fn unsubscribe_frame_shape() {
        let frame = ClientFrame::Unsubscribe {
            channel: Channel::AuctionBids,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "unsubscribe", "channel": "auction_bids"})
        );
    }

    #[test]
    fn parse_ack_frames() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"subscribed","channel":"orderbook"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Subscribed {
                channel: Channel::Orderbook
            }
        );
        assert_eq!(frame.data_channel(), None);

        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"error","message":"subscription rejected"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Error {
                message: "subscription rejected".into()
            }
        );
    }

    #[test]
    fn data_frames_keep_payload_and_channel_binding() {
        let json = r#"{"type":"orderbook_snapshot","clob_id":"0xabc","bids":[],"asks":[]}"#;
        let frame: ServerFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.data_channel(), Some(Channel::Orderbook));
        let ServerFrame::OrderbookSnapshot { payload } = &frame else {
            panic!("expected orderbook snapshot, got {frame:?}");
        };
        assert_eq!(payload["clob_id"], "0xabc");

        let json = r#"{"type":"clob_bids_added","bids":[{"price":"1"}]}"#;
        let frame: ServerFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.data_channel(), Some(Channel::Bids));

        let json = r#"{"type":"auction_bids_added","auction_id":"a-1"}"#;
        let frame: ServerFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.data_channel(), Some(Channel::AuctionBids));
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let result: Result<ServerFrame, _> =
            serde_json::from_str(r#"{"type":"heartbeat","ts":1}"#);
        assert!(result.is_err());
    }
}
