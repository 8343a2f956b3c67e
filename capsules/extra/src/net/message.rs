// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Message buffer pool.
//!
//! Messages are chains of fixed-size buffers drawn from one static pool and
//! addressed by `u16` handles; nothing in the stack holds a pointer into the
//! pool. Four priority levels order messages within a [`PriorityQueue`], and
//! a low-watermark reserve keeps low-priority traffic from exhausting the
//! pool. A message belongs to at most one queue at a time; enqueueing an
//! owned message is a state error.

use kernel::utilities::cells::MapCell;
use kernel::ErrorCode;

use core::cell::Cell;

/// Data bytes per chained buffer.
pub const BUFFER_SIZE: usize = 128;
/// Buffers in the pool.
pub const NUM_BUFFERS: usize = 32;
/// Message descriptors in the pool.
pub const NUM_MESSAGES: usize = 16;
/// Buffers withheld from low-priority allocation.
const LOW_PRIORITY_RESERVE: usize = 4;

const NONE: u16 = 0xffff;

/// Stable handle of a message slot.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MessageHandle(u16);

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Net = 3,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MessageType {
    Ip6,
    MacData,
    MacCommand,
    Supervision,
}

#[derive(Copy, Clone)]
struct Buffer {
    data: [u8; BUFFER_SIZE],
    next: u16,
}

impl Buffer {
    const fn empty() -> Buffer {
        Buffer {
            data: [0; BUFFER_SIZE],
            next: NONE,
        }
    }
}

#[derive(Copy, Clone)]
struct MessageInfo {
    in_use: bool,
    head: u16,
    len: u16,
    offset: u16,
    priority: MessagePriority,
    msg_type: MessageType,
    link_security: bool,
    /// Queue currently owning this message, if any.
    owner: Option<u8>,
    next_in_queue: u16,
}

impl MessageInfo {
    const fn empty() -> MessageInfo {
        MessageInfo {
            in_use: false,
            head: NONE,
            len: 0,
            offset: 0,
            priority: MessagePriority::Normal,
            msg_type: MessageType::Ip6,
            link_security: false,
            owner: None,
            next_in_queue: NONE,
        }
    }
}

pub struct MessagePool {
    buffers: MapCell<[Buffer; NUM_BUFFERS]>,
    free_head: Cell<u16>,
    free_count: Cell<usize>,
    messages: MapCell<[MessageInfo; NUM_MESSAGES]>,
    next_queue_id: Cell<u8>,
}

impl MessagePool {
    pub fn new() -> MessagePool {
        let pool = MessagePool {
            buffers: MapCell::new([Buffer::empty(); NUM_BUFFERS]),
            free_head: Cell::new(0),
            free_count: Cell::new(NUM_BUFFERS),
            messages: MapCell::new([MessageInfo::empty(); NUM_MESSAGES]),
            next_queue_id: Cell::new(0),
        };
        pool.buffers.map(|buffers| {
            for (i, buffer) in buffers.iter_mut().enumerate() {
                buffer.next = if i + 1 < NUM_BUFFERS {
                    (i + 1) as u16
                } else {
                    NONE
                };
            }
        });
        pool
    }

    pub fn free_buffer_count(&self) -> usize {
        self.free_count.get()
    }

    fn reserve_blocks(&self, priority: MessagePriority) -> bool {
        priority == MessagePriority::Low && self.free_count.get() <= LOW_PRIORITY_RESERVE
    }

    fn take_buffer(&self) -> Option<u16> {
        let head = self.free_head.get();
        if head == NONE {
            return None;
        }
        self.buffers.map(|buffers| {
            self.free_head.set(buffers[head as usize].next);
            buffers[head as usize].next = NONE;
        });
        self.free_count.set(self.free_count.get() - 1);
        Some(head)
    }

    fn release_chain(&self, mut index: u16) {
        while index != NONE {
            let next = self
                .buffers
                .map_or(NONE, |buffers| buffers[index as usize].next);
            self.buffers.map(|buffers| {
                buffers[index as usize].next = self.free_head.get();
            });
            self.free_head.set(index);
            self.free_count.set(self.free_count.get() + 1);
            index = next;
        }
    }

    /// Allocate an empty message. Low-priority allocation is refused while
    /// the free-buffer reserve is depleted.
    pub fn allocate(
        &self,
        priority: MessagePriority,
        msg_type: MessageType,
        link_security: bool,
    ) -> Option<MessageHandle> {
        if self.reserve_blocks(priority) {
            return None;
        }
        let slot = self.messages.map_or(None, |messages| {
            messages.iter().position(|m| !m.in_use)
        })?;
        self.messages.map(|messages| {
            messages[slot] = MessageInfo {
                in_use: true,
                priority,
                msg_type,
                link_security,
                ..MessageInfo::empty()
            };
        });
        Some(MessageHandle(slot as u16))
    }

    /// Release a message and its buffer chain. The message must not be
    /// owned by a queue.
    pub fn free(&self, handle: MessageHandle) -> Result<(), ErrorCode> {
        let (head, owned) = self.messages.map_or((NONE, false), |messages| {
            let info = &messages[handle.0 as usize];
            (info.head, info.owner.is_some())
        });
        if owned {
            return Err(ErrorCode::STATE);
        }
        self.release_chain(head);
        self.messages.map(|messages| {
            messages[handle.0 as usize] = MessageInfo::empty();
        });
        Ok(())
    }

    pub fn len(&self, handle: MessageHandle) -> usize {
        self.messages
            .map_or(0, |messages| messages[handle.0 as usize].len as usize)
    }

    pub fn is_empty(&self, handle: MessageHandle) -> bool {
        self.len(handle) == 0
    }

    pub fn priority(&self, handle: MessageHandle) -> MessagePriority {
        self.messages.map_or(MessagePriority::Normal, |messages| {
            messages[handle.0 as usize].priority
        })
    }

    pub fn msg_type(&self, handle: MessageHandle) -> MessageType {
        self.messages.map_or(MessageType::Ip6, |messages| {
            messages[handle.0 as usize].msg_type
        })
    }

    pub fn link_security(&self, handle: MessageHandle) -> bool {
        self.messages
            .map_or(false, |messages| messages[handle.0 as usize].link_security)
    }

    pub fn set_offset(&self, handle: MessageHandle, offset: u16) {
        self.messages.map(|messages| {
            messages[handle.0 as usize].offset = offset;
        });
    }

    pub fn offset(&self, handle: MessageHandle) -> u16 {
        self.messages
            .map_or(0, |messages| messages[handle.0 as usize].offset)
    }

    /// Append bytes, growing the buffer chain as needed.
    pub fn append(&self, handle: MessageHandle, data: &[u8]) -> Result<(), ErrorCode> {
        let priority = self.priority(handle);
        let mut written = 0;
        while written < data.len() {
            let len = self.len(handle);
            let within = len % BUFFER_SIZE;
            let needs_buffer = len == 0 || within == 0;
            if needs_buffer {
                if self.reserve_blocks(priority) {
                    return Err(ErrorCode::NOMEM);
                }
                let new_index = self.take_buffer().ok_or(ErrorCode::NOMEM)?;
                self.messages.map(|messages| {
                    let info = &mut messages[handle.0 as usize];
                    if info.head == NONE {
                        info.head = new_index;
                    } else {
                        let mut tail = info.head;
                        self.buffers.map(|buffers| {
                            while buffers[tail as usize].next != NONE {
                                tail = buffers[tail as usize].next;
                            }
                            buffers[tail as usize].next = new_index;
                        });
                    }
                });
            }
            // Space left in the tail buffer; `len % BUFFER_SIZE == 0` means
            // a freshly chained, entirely free buffer.
            let space = BUFFER_SIZE - (self.len(handle) % BUFFER_SIZE);
            let take = (data.len() - written).min(space);
            self.write_at(handle, self.len(handle), &data[written..written + take]);
            self.messages.map(|messages| {
                messages[handle.0 as usize].len += take as u16;
            });
            written += take;
        }
        Ok(())
    }

    fn buffer_at(&self, handle: MessageHandle, offset: usize) -> Option<(u16, usize)> {
        let head = self
            .messages
            .map_or(NONE, |messages| messages[handle.0 as usize].head);
        if head == NONE {
            return None;
        }
        let mut index = head;
        let mut remaining = offset;
        while remaining >= BUFFER_SIZE {
            index = self.buffers.map_or(NONE, |buffers| buffers[index as usize].next);
            if index == NONE {
                return None;
            }
            remaining -= BUFFER_SIZE;
        }
        Some((index, remaining))
    }

    fn write_at(&self, handle: MessageHandle, offset: usize, data: &[u8]) {
        if let Some((index, within)) = self.buffer_at(handle, offset) {
            self.buffers.map(|buffers| {
                let take = data.len().min(BUFFER_SIZE - within);
                buffers[index as usize].data[within..within + take].copy_from_slice(&data[..take]);
            });
        }
    }

    /// Copy message bytes starting at `offset` into `out`. Returns the
    /// number of bytes copied.
    pub fn read(&self, handle: MessageHandle, offset: usize, out: &mut [u8]) -> usize {
        let len = self.len(handle);
        if offset >= len {
            return 0;
        }
        let mut copied = 0;
        let total = out.len().min(len - offset);
        while copied < total {
            let Some((index, within)) = self.buffer_at(handle, offset + copied) else {
                break;
            };
            let take = (total - copied).min(BUFFER_SIZE - within);
            self.buffers.map(|buffers| {
                out[copied..copied + take]
                    .copy_from_slice(&buffers[index as usize].data[within..within + take]);
            });
            copied += take;
        }
        copied
    }

    /// Create a queue identity for use with the enqueue operations.
    pub fn new_queue(&self) -> MessageQueue {
        let id = self.next_queue_id.get();
        self.next_queue_id.set(id + 1);
        MessageQueue {
            id,
            head: Cell::new(NONE),
        }
    }

    /// Append to a queue. Fails with `STATE` when the message already
    /// belongs to a queue.
    pub fn enqueue(&self, queue: &MessageQueue, handle: MessageHandle) -> Result<(), ErrorCode> {
        let conflict = self.messages.map_or(true, |messages| {
            messages[handle.0 as usize].owner.is_some()
        });
        if conflict {
            return Err(ErrorCode::STATE);
        }
        self.messages.map(|messages| {
            messages[handle.0 as usize].owner = Some(queue.id);
            messages[handle.0 as usize].next_in_queue = NONE;
        });
        if queue.head.get() == NONE {
            queue.head.set(handle.0);
        } else {
            self.messages.map(|messages| {
                let mut tail = queue.head.get();
                while messages[tail as usize].next_in_queue != NONE {
                    tail = messages[tail as usize].next_in_queue;
                }
                messages[tail as usize].next_in_queue = handle.0;
            });
        }
        Ok(())
    }

    pub fn dequeue(&self, queue: &MessageQueue) -> Option<MessageHandle> {
        let head = queue.head.get();
        if head == NONE {
            return None;
        }
        self.messages.map(|messages| {
            queue.head.set(messages[head as usize].next_in_queue);
            messages[head as usize].owner = None;
            messages[head as usize].next_in_queue = NONE;
        });
        Some(MessageHandle(head))
    }

    pub fn queue_is_empty(&self, queue: &MessageQueue) -> bool {
        queue.head.get() == NONE
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self::new()
    }
}

/// A FIFO of messages. Created through [`MessagePool::new_queue`] so every
/// queue has a distinct identity for the ownership invariant.
pub struct MessageQueue {
    id: u8,
    head: Cell<u16>,
}

/// Four FIFOs drained highest priority first.
pub struct PriorityQueue {
    queues: [MessageQueue; 4],
}

impl PriorityQueue {
    pub fn new(pool: &MessagePool) -> PriorityQueue {
        PriorityQueue {
            queues: [
                pool.new_queue(),
                pool.new_queue(),
                pool.new_queue(),
                pool.new_queue(),
            ],
        }
    }

    pub fn enqueue(&self, pool: &MessagePool, handle: MessageHandle) -> Result<(), ErrorCode> {
        let priority = pool.priority(handle);
        pool.enqueue(&self.queues[priority as usize], handle)
    }

    pub fn dequeue(&self, pool: &MessagePool) -> Option<MessageHandle> {
        for queue in self.queues.iter().rev() {
            if let Some(handle) = pool.dequeue(queue) {
                return Some(handle);
            }
        }
        None
    }

    pub fn is_empty(&self, pool: &MessagePool) -> bool {
        self.queues.iter().all(|q| pool.queue_is_empty(q))
    }
}
