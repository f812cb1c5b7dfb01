use std::collections::VecDeque;
use std::fmt::Write;

use crate::buffer::PAGE_SIZE;
use crate::error::PlumeResult;
use crate::index::BPlusTree;
use crate::storage::codec::BPlusTreePageCodec;
use crate::storage::page::BPlusTreePage;

pub fn page_bytes_to_array(bytes: &[u8]) -> [u8; PAGE_SIZE] {
    let mut data = [0u8; PAGE_SIZE];
    data.copy_from_slice(bytes);
    data
}

fn format_key(key: &[u8]) -> String {
    if key.is_empty() {
        return "·".to_string();
    }
    // Most tests index big-endian integers; show those readably and fall
    // back to hex for anything else.
    match key.len() {
        4 => u32::from_be_bytes(key.try_into().unwrap()).to_string(),
        8 => u64::from_be_bytes(key.try_into().unwrap()).to_string(),
        _ => key.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

/// Level-order dump of the tree, one line per node. Debug aid only.
pub fn pretty_format_index_tree(index: &BPlusTree) -> PlumeResult<String> {
    let mut display = String::new();

    if index.is_empty() {
        display.push_str("Empty tree.\n");
        return Ok(display);
    }

    let mut curr_queue = VecDeque::new();
    curr_queue.push_back(index.get_root_page_id());

    let mut level_index = 1;
    while !curr_queue.is_empty() {
        let mut next_queue = VecDeque::new();
        writeln!(display, "B+ Tree Level No.{}:", level_index)
            .expect("writing to String cannot fail");

        while let Some(page_id) = curr_queue.pop_front() {
            let guard = index.buffer_pool.fetch_page_read(page_id)?;
            let (page, _) = BPlusTreePageCodec::decode(guard.data())?;
            drop(guard);
            match page {
                BPlusTreePage::Internal(internal) => {
                    let entries = internal
                        .array
                        .iter()
                        .enumerate()
                        .map(|(i, (k, v))| {
                            if i == 0 {
                                format!("·->{}", v)
                            } else {
                                format!("{}->{}", format_key(k), v)
                            }
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    writeln!(
                        display,
                        "  internal page_id={} size={}/{} [{}]",
                        internal.header.page_id,
                        internal.header.current_size,
                        internal.header.max_size,
                        entries
                    )
                    .expect("writing to String cannot fail");
                    next_queue.extend(internal.values());
                }
                BPlusTreePage::Leaf(leaf) => {
                    let entries = leaf
                        .array
                        .iter()
                        .map(|(k, rid)| format!("{}={}", format_key(k), rid))
                        .collect::<Vec<_>>()
                        .join(", ");
                    writeln!(
                        display,
                        "  leaf page_id={} size={}/{} next={} [{}]",
                        leaf.header.page_id,
                        leaf.header.current_size,
                        leaf.header.max_size,
                        leaf.header.next_page_id,
                        entries
                    )
                    .expect("writing to String cannot fail");
                }
            }
        }

        curr_queue = next_queue;
        level_index += 1;
    }
    Ok(display)
}
