//! Erasure-coding reassembly of update values into stripe cells.

use crate::utils::{Bitmap, ErrCode, ShardTxError};

use bytes::{Bytes, BytesMut};

use reed_solomon_erasure::galois_8::ReedSolomon;

/// Result of splitting the values of one update into EC cells.
#[derive(Debug, Clone)]
pub(crate) struct EcReasb {
    /// Per-value payload: the cells of the touched shards, concatenated in
    /// ascending shard order.
    pub(crate) payloads: Vec<Bytes>,

    /// Per-value cell size.
    pub(crate) cell_sizes: Vec<u32>,

    /// Shards touched by the update.
    pub(crate) tgt_bitmap: Bitmap,
}

/// Splits update values into `data` data cells plus `parity` parity cells
/// each. If every value fits in one cell of `cell_len` bytes, only data
/// shard 0 and the parity shards are touched; otherwise the full stripe is.
pub(crate) fn ec_reassemble(
    values: &[Bytes],
    data: u16,
    parity: u16,
    cell_len: u32,
) -> Result<EcReasb, ShardTxError> {
    if data == 0 {
        return Err(ShardTxError::code(
            ErrCode::Inval,
            "EC class with zero data cells",
        ));
    }
    let rs = if parity > 0 {
        Some(ReedSolomon::new(data as usize, parity as usize)?)
    } else {
        None
    };

    let full_stripe = values.iter().any(|v| v.len() > cell_len as usize);
    let grp_size = data + parity;
    let tgt_bitmap = if full_stripe {
        Bitmap::new(grp_size, true)
    } else {
        Bitmap::from_ones(grp_size, std::iter::once(0).chain(data..grp_size))?
    };

    let mut payloads = Vec::with_capacity(values.len());
    let mut cell_sizes = Vec::with_capacity(values.len());
    for value in values {
        // empty cells are not encodable, so keep at least one byte
        let shard_len = if full_stripe {
            value.len().div_ceil(data as usize)
        } else {
            value.len()
        }
        .max(1);

        let mut padded = BytesMut::zeroed(shard_len * data as usize);
        padded[..value.len()].copy_from_slice(value);
        let mut shards: Vec<BytesMut> = Vec::with_capacity(grp_size as usize);
        for _ in 0..data {
            shards.push(padded.split_to(shard_len));
        }
        for _ in 0..parity {
            shards.push(BytesMut::zeroed(shard_len));
        }
        if let Some(rs) = rs.as_ref() {
            let slices: Vec<&mut BytesMut> = shards.iter_mut().collect();
            rs.encode(slices)?;
        }

        let mut payload =
            BytesMut::with_capacity(shard_len * tgt_bitmap.count() as usize);
        for (idx, shard) in shards.iter().enumerate() {
            if tgt_bitmap.get(idx as u16) {
                payload.extend_from_slice(shard);
            }
        }
        payloads.push(payload.freeze());
        cell_sizes.push(u32::try_from(shard_len)?);
    }

    Ok(EcReasb {
        payloads,
        cell_sizes,
        tgt_bitmap,
    })
}

/// Reassembles the original value from an EC payload whose touched shards
/// are listed in `shards` (ascending). Only data cells are consulted.
pub(crate) fn ec_extract(
    payload: &Bytes,
    size: u64,
    cell_size: u32,
    data: u16,
    shards: &[u16],
) -> Result<Bytes, ShardTxError> {
    let cell = cell_size as usize;
    if payload.len() != cell * shards.len() {
        return Err(ShardTxError::code(
            ErrCode::Proto,
            format!(
                "EC payload length {} mismatches {} cells of {}",
                payload.len(),
                shards.len(),
                cell
            ),
        ));
    }
    let mut value = BytesMut::with_capacity(cell * data as usize);
    for (pos, shard) in shards.iter().enumerate() {
        if *shard < data {
            value.extend_from_slice(&payload[pos * cell..(pos + 1) * cell]);
        }
    }
    let size = usize::try_from(size)?;
    if value.len() < size {
        return Err(ShardTxError::code(
            ErrCode::Proto,
            format!("EC payload too short for value of {} bytes", size),
        ));
    }
    value.truncate(size);
    Ok(value.freeze())
}

#[cfg(test)]
mod ecreasb_tests {
    use super::*;

    fn shards_of(map: &Bitmap) -> Vec<u16> {
        map.ones().collect()
    }

    #[test]
    fn single_cell() -> Result<(), ShardTxError> {
        let value = Bytes::from(vec![7u8; 100]);
        let reasb = ec_reassemble(&[value.clone()], 4, 2, 4096)?;
        assert_eq!(shards_of(&reasb.tgt_bitmap), vec![0, 4, 5]);
        assert_eq!(reasb.cell_sizes, vec![100]);
        assert_eq!(reasb.payloads[0].len(), 300);
        let back = ec_extract(
            &reasb.payloads[0],
            100,
            100,
            4,
            &shards_of(&reasb.tgt_bitmap),
        )?;
        assert_eq!(back, value);
        Ok(())
    }

    #[test]
    fn full_stripe() -> Result<(), ShardTxError> {
        let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let values = vec![Bytes::from(big), Bytes::from_static(b"tiny")];
        let reasb = ec_reassemble(&values, 4, 2, 4096)?;
        assert_eq!(reasb.tgt_bitmap.count(), 6);
        assert_eq!(reasb.cell_sizes, vec![1250, 1]);
        let shards = shards_of(&reasb.tgt_bitmap);
        for (i, value) in values.iter().enumerate() {
            let back = ec_extract(
                &reasb.payloads[i],
                value.len() as u64,
                reasb.cell_sizes[i],
                4,
                &shards,
            )?;
            assert_eq!(&back, value);
        }
        Ok(())
    }

    #[test]
    fn parity_matches_codec() -> Result<(), ShardTxError> {
        let value = Bytes::from(vec![3u8; 64]);
        let reasb = ec_reassemble(&[value], 2, 1, 16)?;
        let cells: Vec<Vec<u8>> =
            reasb.payloads[0].chunks(32).map(|c| c.to_vec()).collect();
        assert_eq!(cells.len(), 3);
        let rs = ReedSolomon::new(2, 1)?;
        assert!(rs.verify(&cells)?);
        Ok(())
    }

    #[test]
    fn bad_payload() {
        let payload = Bytes::from_static(b"abc");
        assert!(ec_extract(&payload, 3, 2, 2, &[0, 1]).is_err());
    }
}
