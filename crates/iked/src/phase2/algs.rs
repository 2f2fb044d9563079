//! Kernel algorithm table
//!
//! Learned from REGISTER replies. An ACQUIRE combination naming an algorithm
//! the kernel never registered cannot be negotiated.

use crate::pfkey::constants::{AlgType, ExtType, SaType};
use crate::pfkey::message::{AlgDesc, Ecomb, Message, SupportedAlg, SupportedExt};

/// Algorithms the kernel supports, per SA type and category
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlgorithmTable {
    /// AH integrity algorithms
    pub ah_auth: Vec<SupportedAlg>,
    /// ESP integrity algorithms
    pub esp_auth: Vec<SupportedAlg>,
    /// ESP ciphers
    pub esp_encr: Vec<SupportedAlg>,
}

impl AlgorithmTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entries for the REGISTER message's SA type
    ///
    /// Returns false when the message carries no supported-algorithm
    /// extension for a known SA type.
    pub fn update_from_register(&mut self, msg: &Message) -> bool {
        let auth = msg
            .get::<SupportedExt>(ExtType::SupportedAuth)
            .map(|s| s.algs);
        let encr = msg
            .get::<SupportedExt>(ExtType::SupportedEncrypt)
            .map(|s| s.algs);

        match msg.sa_type() {
            Some(SaType::Ah) => match auth {
                Some(algs) => {
                    self.ah_auth = algs;
                    true
                }
                None => false,
            },
            Some(SaType::Esp) => {
                let updated = auth.is_some() || encr.is_some();
                if let Some(algs) = auth {
                    self.esp_auth = algs;
                }
                if let Some(algs) = encr {
                    self.esp_encr = algs;
                }
                updated
            }
            _ => false,
        }
    }

    fn list(&self, satype: u8, algtype: u8) -> Option<&[SupportedAlg]> {
        let satype = SaType::from_u8(satype)?;
        let algtype = AlgType::from_u8(algtype)?;
        match (satype, algtype) {
            (SaType::Ah, AlgType::Auth) => Some(&self.ah_auth),
            (SaType::Esp, AlgType::Auth) => Some(&self.esp_auth),
            (SaType::Esp, AlgType::Crypt) => Some(&self.esp_encr),
            _ => None,
        }
    }

    /// Kernel entry for an algorithm
    pub fn find(&self, satype: u8, algtype: u8, alg: u8) -> Option<&SupportedAlg> {
        self.list(satype, algtype)?.iter().find(|a| a.id == alg)
    }

    /// Whether the kernel registered an algorithm descriptor's algorithm
    pub fn supports(&self, desc: &AlgDesc) -> bool {
        self.find(desc.satype, desc.algtype, desc.alg).is_some()
    }

    /// Whether every algorithm of a combination is supported
    pub fn comb_supported(&self, comb: &Ecomb) -> bool {
        !comb.algs.is_empty() && comb.algs.iter().all(|d| self.supports(d))
    }

    /// Whether nothing was registered yet
    pub fn is_empty(&self) -> bool {
        self.ah_auth.is_empty() && self.esp_auth.is_empty() && self.esp_encr.is_empty()
    }
}
