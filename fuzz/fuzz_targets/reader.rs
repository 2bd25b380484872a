#![no_main]
use libfuzzer_sys::fuzz_target;
use smol::{io::BufReader, stream::StreamExt};

fuzz_target!(|data: &[u8]| {
    smol::block_on(async {
        let r = BufReader::new(data);
        let mut ar = tarstream::TarReader::new(r);
        while let Some(entry) = ar.next().await {
            match entry {
                Ok(mut entry) => {
                    // leave every other entry to the skip path
                    if entry.data_len() % 2 == 0
                        && smol::io::copy(&mut entry, &mut smol::io::sink()).await.is_err()
                    {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    })
});
