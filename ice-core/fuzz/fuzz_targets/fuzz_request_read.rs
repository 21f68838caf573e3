#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

use ice_core::{Identity, InputStream};

// Reads the fields of a request body in order, the way an adapter does.
fuzz_target!(|data: &[u8]| {
    let mut is = InputStream::new(Bytes::copy_from_slice(data));
    let _ = (|| -> ice_core::Result<()> {
        let _request_id = is.read_i32()?;
        let _identity: Identity = is.read()?;
        let _facet = is.read_string_seq()?;
        let _operation = is.read_string()?;
        let _mode = is.read_u8()?;
        let _context = is.read_context()?;
        let _params = is.read_encapsulation()?;
        Ok(())
    })();
});
