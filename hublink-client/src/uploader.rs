//! Chunked program upload: stop whatever is running, clear the old program,
//! announce the size, stream the blob in bounded writes, start it.

use hublink_proto::{Capabilities, Command, WRITE_USER_RAM_HEADER};

use crate::connection::{Connection, Status};
use crate::error::Error;

/// Build the full command sequence for one upload. Fails before producing
/// anything if the blob exceeds the hub's advertised maximum, or if the
/// advertised write size cannot fit a single payload byte. The capability
/// record is device input and must not be trusted to be sane.
pub fn upload_plan(blob: &[u8], capabilities: &Capabilities) -> Result<Vec<Command>, Error> {
    if capabilities.max_write_size as usize <= WRITE_USER_RAM_HEADER {
        return Err(Error::WriteSizeTooSmall(capabilities.max_write_size));
    }
    if blob.len() > capabilities.max_user_program_size as usize {
        return Err(Error::ProgramTooLarge {
            size: blob.len(),
            max: capabilities.max_user_program_size,
        });
    }

    let chunk_size = capabilities.max_write_size as usize - WRITE_USER_RAM_HEADER;
    let mut plan = vec![
        Command::StopUserProgram,
        // size 0 first: clears the previously accepted program so the hub
        // starts from a known state
        Command::WriteUserProgramMeta { size: 0 },
        Command::WriteUserProgramMeta { size: blob.len() as u32 },
    ];
    for (index, chunk) in blob.chunks(chunk_size).enumerate() {
        plan.push(Command::WriteUserRam {
            offset: (index * chunk_size) as u32,
            payload: chunk.to_vec(),
        });
    }
    plan.push(Command::LegacyStartUserProgram);
    Ok(plan)
}

/// Upload and start a compiled program blob. Each write is awaited before
/// the next one; the hub buffer holds a single outstanding write. A failed
/// write aborts the sequence - the whole upload must be retried, since the
/// program state on the hub was already cleared.
pub async fn upload(connection: &Connection, blob: &[u8]) -> Result<(), Error> {
    if connection.status() != Status::Connected {
        return Err(Error::NotConnected);
    }
    let capabilities = connection.capabilities().ok_or(Error::CapabilitiesUnavailable)?;
    let plan = upload_plan(blob, &capabilities)?;
    connection.diagnostics().clear_errors();

    tracing::debug!("uploading {} bytes in {} commands", blob.len(), plan.len());
    for command in &plan {
        connection.write(&command.encode(), false).await.map_err(|e| match e {
            Error::Ble(source) => Error::Transfer(source),
            other => other,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(max_write_size: u16, max_user_program_size: u32) -> Capabilities {
        Capabilities { max_write_size, max_user_program_size }
    }

    #[test]
    fn oversized_blob_rejected_before_any_command() {
        let blob = vec![0u8; 4097];
        match upload_plan(&blob, &caps(100, 4096)) {
            Err(Error::ProgramTooLarge { size: 4097, max: 4096 }) => {}
            other => panic!("expected ProgramTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn degenerate_write_size_rejected() {
        // a max write of 5 leaves zero payload bytes per chunk, anything
        // below that would underflow; both must fail, never panic
        let blob = vec![0u8; 10];
        for max_write_size in [0, 4, 5] {
            match upload_plan(&blob, &caps(max_write_size, 4096)) {
                Err(Error::WriteSizeTooSmall(reported)) => assert_eq!(reported, max_write_size),
                other => panic!("expected WriteSizeTooSmall, got {other:?}"),
            }
        }
    }

    #[test]
    fn chunks_respect_write_size_and_order() {
        // max write 23 minus the 5 byte header leaves 18 bytes per chunk
        let blob: Vec<u8> = (0u8..40).collect();
        let plan = upload_plan(&blob, &caps(23, 4096)).unwrap();

        assert_eq!(plan[0], Command::StopUserProgram);
        assert_eq!(plan[1], Command::WriteUserProgramMeta { size: 0 });
        assert_eq!(plan[2], Command::WriteUserProgramMeta { size: 40 });

        let ram_writes: Vec<(u32, usize)> = plan
            .iter()
            .filter_map(|c| match c {
                Command::WriteUserRam { offset, payload } => Some((*offset, payload.len())),
                _ => None,
            })
            .collect();
        assert_eq!(ram_writes, vec![(0, 18), (18, 18), (36, 4)]);

        assert_eq!(plan.last(), Some(&Command::LegacyStartUserProgram));
    }

    #[test]
    fn chunks_reassemble_to_the_blob() {
        let blob: Vec<u8> = (0..=255).cycle().take(1000).map(|b| b as u8).collect();
        let plan = upload_plan(&blob, &caps(100, 4096)).unwrap();

        let mut reassembled = vec![0u8; blob.len()];
        for command in &plan {
            if let Command::WriteUserRam { offset, payload } = command {
                let start = *offset as usize;
                reassembled[start..start + payload.len()].copy_from_slice(payload);
            }
        }
        assert_eq!(reassembled, blob);
    }

    #[test]
    fn empty_blob_still_clears_and_starts() {
        let plan = upload_plan(&[], &caps(23, 4096)).unwrap();
        assert_eq!(
            plan,
            vec![
                Command::StopUserProgram,
                Command::WriteUserProgramMeta { size: 0 },
                Command::WriteUserProgramMeta { size: 0 },
                Command::LegacyStartUserProgram,
            ]
        );
    }
}
