//! Extended query protocol backend messages.

use crate::error::{Error, Result};
use crate::protocol::codec::{expect_end, read_i16, read_u32};
use crate::protocol::types::Oid;

/// ParameterDescription message - describes parameters for a prepared statement.
#[derive(Debug, Clone)]
pub struct ParameterDescription {
    param_oids: Vec<Oid>,
}

impl ParameterDescription {
    /// Parse a ParameterDescription message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (num_params, mut data) = read_i16(payload)?;
        if num_params < 0 {
            return Err(Error::Protocol(format!(
                "ParameterDescription: negative count {}",
                num_params
            )));
        }

        let mut param_oids = Vec::with_capacity(num_params as usize);
        for _ in 0..num_params {
            let (oid, rest) = read_u32(data)?;
            param_oids.push(oid);
            data = rest;
        }
        expect_end(data, "ParameterDescription")?;

        Ok(Self { param_oids })
    }

    /// Get parameter type OIDs.
    pub fn oids(&self) -> &[Oid] {
        &self.param_oids
    }

    pub fn into_oids(self) -> Vec<Oid> {
        self.param_oids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_description() {
        let mut payload = 2_i16.to_be_bytes().to_vec();
        payload.extend_from_slice(&23_u32.to_be_bytes());
        payload.extend_from_slice(&25_u32.to_be_bytes());
        let desc = ParameterDescription::parse(&payload).unwrap();
        assert_eq!(desc.oids(), &[23, 25]);

        assert!(ParameterDescription::parse(&payload[..9]).is_err());
    }
}
