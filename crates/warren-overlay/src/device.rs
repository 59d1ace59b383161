// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{OverlayError, Result};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address};
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Instant as StdInstant;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, instrument, trace, warn};

const TCP_RX_BUFFER_SIZE: usize = 65536;
const TCP_TX_BUFFER_SIZE: usize = 65536;

/// Bound on queued packets in either direction; overflow drops the oldest.
const MAX_QUEUE_SIZE: usize = 1024;

/// Listening sockets kept armed per listener port.
const LISTEN_BACKLOG: usize = 4;

fn smoltcp_now() -> SmoltcpInstant {
	static START: std::sync::OnceLock<StdInstant> = std::sync::OnceLock::new();
	let start = START.get_or_init(StdInstant::now);
	SmoltcpInstant::from_micros(start.elapsed().as_micros() as i64)
}

struct QueueDevice {
	rx_queue: VecDeque<Vec<u8>>,
	tx_queue: VecDeque<Vec<u8>>,
	mtu: usize,
}

impl QueueDevice {
	fn new(mtu: u16) -> Self {
		Self {
			rx_queue: VecDeque::new(),
			tx_queue: VecDeque::new(),
			mtu: mtu as usize,
		}
	}
}

struct QueueRxToken {
	data: Vec<u8>,
}

impl RxToken for QueueRxToken {
	fn consume<R, F>(mut self, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		f(&mut self.data)
	}
}

struct QueueTxToken<'a> {
	tx_queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> TxToken for QueueTxToken<'a> {
	fn consume<R, F>(self, len: usize, f: F) -> R
	where
		F: FnOnce(&mut [u8]) -> R,
	{
		let mut buffer = vec![0u8; len];
		let result = f(&mut buffer);
		if self.tx_queue.len() >= MAX_QUEUE_SIZE {
			warn!(queue = "tx", "packet queue full, dropping oldest packet");
			self.tx_queue.pop_front();
		}
		self.tx_queue.push_back(buffer);
		result
	}
}

impl Device for QueueDevice {
	type RxToken<'a> = QueueRxToken;
	type TxToken<'a> = QueueTxToken<'a>;

	fn receive(
		&mut self,
		_timestamp: SmoltcpInstant,
	) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
		if let Some(data) = self.rx_queue.pop_front() {
			Some((
				QueueRxToken { data },
				QueueTxToken {
					tx_queue: &mut self.tx_queue,
				},
			))
		} else {
			None
		}
	}

	fn transmit(&mut self, _timestamp: SmoltcpInstant) -> Option<Self::TxToken<'_>> {
		Some(QueueTxToken {
			tx_queue: &mut self.tx_queue,
		})
	}

	fn capabilities(&self) -> DeviceCapabilities {
		let mut caps = DeviceCapabilities::default();
		caps.max_transmission_unit = self.mtu;
		caps.medium = Medium::Ip;
		caps
	}
}

struct StackInner {
	device: QueueDevice,
	iface: Interface,
	sockets: SocketSet<'static>,
	wakers: Vec<Waker>,
	// Handles closed by streams, reclaimed once fully drained.
	reap: Vec<SocketHandle>,
}

impl StackInner {
	fn reap_closed(&mut self) {
		let mut kept = Vec::new();
		for handle in self.reap.drain(..) {
			let state = self.sockets.get::<TcpSocket>(handle).state();
			if state == TcpState::Closed {
				self.sockets.remove(handle);
			} else {
				kept.push(handle);
			}
		}
		self.reap = kept;
	}
}

/// An in-process IPv4 network stack bound to the node's virtual address.
///
/// Encrypted overlay traffic is fed in with [`NetStack::receive_packet`];
/// outbound IP packets are drained with [`NetStack::transmit_packet`]. TCP
/// listeners and streams ride on top via smoltcp.
pub struct NetStack {
	address: Ipv4Addr,
	mtu: u16,
	inner: Arc<Mutex<StackInner>>,
}

impl NetStack {
	#[instrument(skip_all, fields(%address, prefix_len, mtu))]
	pub fn new(address: Ipv4Addr, prefix_len: u8, mtu: u16) -> Result<Self> {
		let mut device = QueueDevice::new(mtu);

		let config = Config::new(HardwareAddress::Ip);
		let mut iface = Interface::new(config, &mut device, smoltcp_now());

		let smoltcp_addr = Ipv4Address::from_bytes(&address.octets());
		iface.update_ip_addrs(|addrs| {
			addrs
				.push(IpCidr::new(IpAddress::Ipv4(smoltcp_addr), prefix_len))
				.ok();
		});

		let sockets = SocketSet::new(vec![]);

		debug!("created user-space network stack");

		Ok(Self {
			address,
			mtu,
			inner: Arc::new(Mutex::new(StackInner {
				device,
				iface,
				sockets,
				wakers: Vec::new(),
				reap: Vec::new(),
			})),
		})
	}

	/// Injects a decrypted IP packet received from the overlay.
	pub fn receive_packet(&self, data: &[u8]) -> Result<()> {
		let mut inner = self
			.inner
			.lock()
			.map_err(|e| OverlayError::Device(format!("lock poisoned: {}", e)))?;

		if inner.device.rx_queue.len() >= MAX_QUEUE_SIZE {
			warn!(queue = "rx", "packet queue full, dropping oldest packet");
			inner.device.rx_queue.pop_front();
		}
		inner.device.rx_queue.push_back(data.to_vec());

		self.poll_iface(&mut inner);

		for waker in inner.wakers.drain(..) {
			waker.wake();
		}

		Ok(())
	}

	/// Drains one outbound IP packet destined for the overlay, if any.
	pub fn transmit_packet(&self) -> Option<Vec<u8>> {
		let mut inner = self.inner.lock().ok()?;

		self.poll_iface(&mut inner);

		let packet = inner.device.tx_queue.pop_front();
		if packet.is_some() {
			for waker in inner.wakers.drain(..) {
				waker.wake();
			}
			trace!("transmitting packet from network stack");
		}
		packet
	}

	pub fn poll(&self) -> bool {
		let mut inner = match self.inner.lock() {
			Ok(i) => i,
			Err(_) => return false,
		};

		self.poll_iface(&mut inner)
	}

	fn poll_iface(&self, inner: &mut StackInner) -> bool {
		let timestamp = smoltcp_now();
		inner.reap_closed();
		let StackInner {
			device,
			iface,
			sockets,
			..
		} = inner;
		iface.poll(timestamp, device, sockets)
	}

	pub fn address(&self) -> Ipv4Addr {
		self.address
	}

	pub fn mtu(&self) -> u16 {
		self.mtu
	}

	fn new_tcp_socket() -> TcpSocket<'static> {
		let rx_buffer = SocketBuffer::new(vec![0u8; TCP_RX_BUFFER_SIZE]);
		let tx_buffer = SocketBuffer::new(vec![0u8; TCP_TX_BUFFER_SIZE]);
		TcpSocket::new(rx_buffer, tx_buffer)
	}

	fn add_listening_socket(sockets: &mut SocketSet<'static>, port: u16) -> Result<SocketHandle> {
		let mut socket = Self::new_tcp_socket();
		socket
			.listen(port)
			.map_err(|e| OverlayError::Device(format!("listen failed: {}", e)))?;
		Ok(sockets.add(socket))
	}

	/// Opens a TCP listener on the stack's own address.
	pub fn listen(&self, port: u16) -> Result<NetstackListener> {
		let mut inner = self
			.inner
			.lock()
			.map_err(|e| OverlayError::Device(format!("lock poisoned: {}", e)))?;

		let mut pending = Vec::with_capacity(LISTEN_BACKLOG);
		for _ in 0..LISTEN_BACKLOG {
			pending.push(Self::add_listening_socket(&mut inner.sockets, port)?);
		}

		let local_addr = SocketAddrV4::new(self.address, port);
		debug!(%local_addr, "listening on network stack");

		Ok(NetstackListener {
			stack: self.clone(),
			port,
			pending: Mutex::new(pending),
			local_addr,
		})
	}

	fn register_waker(&self, waker: Waker) {
		if let Ok(mut inner) = self.inner.lock() {
			inner.wakers.push(waker);
		}
	}
}

impl Clone for NetStack {
	fn clone(&self) -> Self {
		Self {
			address: self.address,
			mtu: self.mtu,
			inner: Arc::clone(&self.inner),
		}
	}
}

/// A TCP listener on the user-space stack.
///
/// Keeps a small backlog of armed smoltcp sockets so concurrent handshakes
/// are not refused while an accepted connection is being handed off.
pub struct NetstackListener {
	stack: NetStack,
	port: u16,
	pending: Mutex<Vec<SocketHandle>>,
	local_addr: SocketAddrV4,
}

impl std::fmt::Debug for NetstackListener {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("NetstackListener")
			.field("port", &self.port)
			.field("local_addr", &self.local_addr)
			.finish()
	}
}

impl NetstackListener {
	pub async fn accept(&self) -> Result<(NetstackStream, SocketAddrV4)> {
		loop {
			if let Some(accepted) = self.try_accept()? {
				return Ok(accepted);
			}

			tokio::time::sleep(std::time::Duration::from_millis(10)).await;
			self.stack.poll();
		}
	}

	fn try_accept(&self) -> Result<Option<(NetstackStream, SocketAddrV4)>> {
		let mut inner = self
			.stack
			.inner
			.lock()
			.map_err(|e| OverlayError::Device(format!("lock poisoned: {}", e)))?;

		let mut pending = self
			.pending
			.lock()
			.map_err(|e| OverlayError::Device(format!("lock poisoned: {}", e)))?;

		for slot in pending.iter_mut() {
			let (state, remote) = {
				let socket = inner.sockets.get::<TcpSocket>(*slot);
				(socket.state(), socket.remote_endpoint())
			};

			if state == TcpState::Established {
				if let Some(remote) = remote {
					let IpAddress::Ipv4(v4) = remote.addr;
					let remote_addr = SocketAddrV4::new(Ipv4Addr::from(v4.0), remote.port);

					let handle = *slot;
					// Re-arm the slot so the next handshake finds a listener.
					*slot = NetStack::add_listening_socket(&mut inner.sockets, self.port)?;

					let stream = NetstackStream {
						stack: self.stack.clone(),
						handle,
					};
					return Ok(Some((stream, remote_addr)));
				}
			}
		}

		Ok(None)
	}

	pub fn local_addr(&self) -> SocketAddrV4 {
		self.local_addr
	}
}

/// An established TCP connection on the user-space stack.
pub struct NetstackStream {
	stack: NetStack,
	handle: SocketHandle,
}

impl NetstackStream {
	fn poll_read_inner(&self, buf: &mut [u8]) -> io::Result<usize> {
		let mut inner = self
			.stack
			.inner
			.lock()
			.map_err(|e| io::Error::other(format!("lock poisoned: {}", e)))?;

		self.stack.poll_iface(&mut inner);

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		if socket.can_recv() {
			socket
				.recv_slice(buf)
				.map_err(|e| io::Error::other(format!("{}", e)))
		} else if socket.may_recv() {
			Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
		} else {
			Ok(0)
		}
	}

	fn poll_write_inner(&self, buf: &[u8]) -> io::Result<usize> {
		let mut inner = self
			.stack
			.inner
			.lock()
			.map_err(|e| io::Error::other(format!("lock poisoned: {}", e)))?;

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);

		if socket.can_send() {
			match socket.send_slice(buf) {
				Ok(n) => {
					self.stack.poll_iface(&mut inner);
					Ok(n)
				}
				Err(e) => Err(io::Error::other(format!("{}", e))),
			}
		} else if socket.may_send() {
			Err(io::Error::new(io::ErrorKind::WouldBlock, "buffer full"))
		} else {
			Err(io::Error::new(io::ErrorKind::NotConnected, "not connected"))
		}
	}
}

impl AsyncRead for NetstackStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		match self.poll_read_inner(buf.initialize_unfilled()) {
			Ok(n) => {
				buf.advance(n);
				Poll::Ready(Ok(()))
			}
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
				self.stack.register_waker(cx.waker().clone());
				Poll::Pending
			}
			Err(e) => Poll::Ready(Err(e)),
		}
	}
}

impl AsyncWrite for NetstackStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match self.poll_write_inner(buf) {
			Ok(n) => Poll::Ready(Ok(n)),
			Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
				self.stack.register_waker(cx.waker().clone());
				Poll::Pending
			}
			Err(e) => Poll::Ready(Err(e)),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.stack.poll();
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let mut inner = self
			.stack
			.inner
			.lock()
			.map_err(|e| io::Error::other(format!("lock poisoned: {}", e)))?;

		let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);
		socket.close();

		Poll::Ready(Ok(()))
	}
}

impl Drop for NetstackStream {
	fn drop(&mut self) {
		if let Ok(mut inner) = self.stack.inner.lock() {
			let socket = inner.sockets.get_mut::<TcpSocket>(self.handle);
			socket.close();
			inner.reap.push(self.handle);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stack_creation() {
		let addr: Ipv4Addr = "10.1.0.100".parse().unwrap();
		let stack = NetStack::new(addr, 24, 1420).unwrap();

		assert_eq!(stack.address(), addr);
		assert_eq!(stack.mtu(), 1420);
	}

	#[test]
	fn stack_poll_is_safe_when_idle() {
		let addr: Ipv4Addr = "10.1.0.100".parse().unwrap();
		let stack = NetStack::new(addr, 24, 1420).unwrap();
		stack.poll();
		assert!(stack.transmit_packet().is_none());
	}

	#[test]
	fn stack_clone_shares_state() {
		let addr: Ipv4Addr = "10.1.0.100".parse().unwrap();
		let stack = NetStack::new(addr, 24, 1420).unwrap();
		let clone = stack.clone();

		assert_eq!(stack.address(), clone.address());
		assert!(Arc::ptr_eq(&stack.inner, &clone.inner));
	}

	#[test]
	fn listener_arms_a_backlog() {
		let addr: Ipv4Addr = "10.1.0.100".parse().unwrap();
		let stack = NetStack::new(addr, 24, 1420).unwrap();

		let listener = stack.listen(80).unwrap();
		assert_eq!(listener.local_addr(), "10.1.0.100:80".parse().unwrap());

		let pending = listener.pending.lock().unwrap();
		assert_eq!(pending.len(), LISTEN_BACKLOG);
	}

	#[test]
	fn receive_packet_bounds_queue() {
		let addr: Ipv4Addr = "10.1.0.100".parse().unwrap();
		let stack = NetStack::new(addr, 24, 1420).unwrap();

		for _ in 0..(MAX_QUEUE_SIZE + 10) {
			stack.receive_packet(&[0u8; 20]).unwrap();
		}

		let inner = stack.inner.lock().unwrap();
		assert!(inner.device.rx_queue.len() <= MAX_QUEUE_SIZE);
	}
}
