//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Instant;

use fynx_iked::config::DaemonConfig;
use fynx_iked::daemon::Daemon;
use fynx_iked::error::Result;
use fynx_iked::negotiation::{
    DeleteRequest, NegotiationEngine, NegotiationId, Notification, Phase1Request, Phase2Request,
};
use fynx_iked::pfkey::constants::{aalg, ealg, AlgType, ExtType, MsgType, SaType};
use fynx_iked::pfkey::message::{AddressExt, AlgDesc, Ecomb, EpropExt, SaExt, SupportedAlg, SupportedExt};
use fynx_iked::pfkey::Message;
use fynx_iked::policy::{AddressSpec, Rule, Rulebase};

pub const PID: u32 = 4242;

/// Negotiation engine that records every request
#[derive(Debug, Default)]
pub struct RecordingEngine {
    pub phase1: Vec<Phase1Request>,
    pub phase2: Vec<Phase2Request>,
    pub notifications: Vec<Notification>,
    pub deletes: Vec<DeleteRequest>,
    pub deleted_negotiations: Vec<(NegotiationId, bool)>,
}

impl NegotiationEngine for RecordingEngine {
    fn initiate_phase1(&mut self, request: Phase1Request) -> Result<NegotiationId> {
        self.phase1.push(request);
        Ok(self.phase1.len() as NegotiationId)
    }

    fn initiate_phase2(&mut self, request: Phase2Request) -> Result<NegotiationId> {
        self.phase2.push(request);
        Ok(1000 + self.phase2.len() as NegotiationId)
    }

    fn send_notification(&mut self, notification: Notification) -> Result<()> {
        self.notifications.push(notification);
        Ok(())
    }

    fn send_delete(&mut self, request: DeleteRequest) -> Result<()> {
        self.deletes.push(request);
        Ok(())
    }

    fn delete_negotiation(&mut self, negotiation: NegotiationId, notify_peer: bool) -> Result<()> {
        self.deleted_negotiations.push((negotiation, notify_peer));
        Ok(())
    }
}

pub type TestDaemon = Daemon<Vec<Vec<u8>>, RecordingEngine>;

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn any_rule(label: &str) -> Rule {
    Rule::new(label).with_addresses(AddressSpec::any(), AddressSpec::any())
}

pub fn daemon_with(rulebase: Rulebase) -> TestDaemon {
    let config = DaemonConfig::builder()
        .with_local_address("10.0.0.1".parse().unwrap())
        .build()
        .unwrap();
    Daemon::new(config, Vec::new(), PID, RecordingEngine::default(), rulebase).unwrap()
}

/// Daemon with a catch-all rule and ESP algorithms registered
pub fn registered_daemon() -> TestDaemon {
    let mut d = daemon_with([any_rule("any")].into_iter().collect());
    d.on_kernel_message(esp_register(), Instant::now()).unwrap();
    d
}

pub fn esp_register() -> Message {
    let alg = |id, minbits, maxbits, increment| SupportedAlg {
        id,
        ivlen: 16,
        minbits,
        maxbits,
        increment,
        saltbits: 0,
    };
    Message::new(MsgType::Register, SaType::Esp)
        .with(SupportedExt {
            kind: ExtType::SupportedAuth,
            algs: vec![alg(aalg::SHA1_HMAC, 160, 160, 0)],
        })
        .with(SupportedExt {
            kind: ExtType::SupportedEncrypt,
            algs: vec![alg(ealg::AES_CBC, 128, 256, 64)],
        })
}

pub fn esp_eprop() -> EpropExt {
    let desc = |algtype: AlgType, alg| AlgDesc {
        satype: SaType::Esp.to_u8(),
        algtype: algtype.to_u8(),
        alg,
        minbits: 128,
        maxbits: 256,
    };
    EpropExt {
        replay: 32,
        combs: vec![Ecomb {
            hard_addtime: 3600,
            algs: vec![desc(AlgType::Auth, aalg::SHA1_HMAC), desc(AlgType::Crypt, ealg::AES_CBC)],
            ..Ecomb::default()
        }],
    }
}

/// Kernel ACQUIRE for traffic from us (10.0.0.1) to the peer (10.0.0.2)
pub fn acquire(seq: u32) -> Message {
    Message::new(MsgType::Acquire, SaType::Esp)
        .with_seq(seq)
        .with(AddressExt::new(ExtType::AddressSrc, addr("10.0.0.1:0")))
        .with(AddressExt::new(ExtType::AddressDst, addr("10.0.0.2:0")))
        .with(esp_eprop())
}

/// Everything written to the kernel so far
pub fn sent(d: &TestDaemon) -> Vec<Message> {
    d.transport()
        .iter()
        .map(|w| Message::from_bytes(w).unwrap())
        .collect()
}

/// Last message written to the kernel
pub fn last_sent(d: &TestDaemon) -> Message {
    sent(d).pop().expect("nothing sent")
}

/// Successful kernel answer to `request`
pub fn reply_to(request: &Message) -> Message {
    request.header_only().with_pid(PID)
}

/// GETSPI answer carrying `spi`
pub fn getspi_reply(request: &Message, spi: u32) -> Message {
    reply_to(request).with(SaExt {
        spi,
        ..SaExt::default()
    })
}

/// Kernel error answer to `request`
pub fn error_reply(request: &Message, errno: u8, diagnostic: u16) -> Message {
    let mut reply = reply_to(request);
    reply.errno = errno;
    reply.diagnostic = diagnostic;
    reply
}
